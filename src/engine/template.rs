//! Template Renderer (C1): Liquid-style substitution of `{{ name }}` and
//! control tags (`{% if %}`, `{% for %}`, filters such as `upcase`, `strip`,
//! `size`). Missing variables render as empty string rather than erroring —
//! this is native Liquid behavior and requires no special casing here.

use liquid::model::{KString, Value as LiquidValue};
use liquid::{Object, Parser, ParserBuilder, Template};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("template '{template_name}' failed: {message}")]
pub struct TemplateError {
    pub template_name: String,
    pub message: String,
}

fn json_to_liquid(value: &serde_json::Value) -> LiquidValue {
    match value {
        serde_json::Value::Null => LiquidValue::Nil,
        serde_json::Value::Bool(b) => LiquidValue::scalar(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                LiquidValue::scalar(i)
            } else if let Some(f) = n.as_f64() {
                LiquidValue::scalar(f)
            } else {
                LiquidValue::scalar(n.to_string())
            }
        }
        serde_json::Value::String(s) => LiquidValue::scalar(s.clone()),
        serde_json::Value::Array(items) => {
            LiquidValue::Array(items.iter().map(json_to_liquid).collect())
        }
        serde_json::Value::Object(map) => {
            let object: Object = map
                .iter()
                .map(|(k, v)| (KString::from_string(k.clone()), json_to_liquid(v)))
                .collect();
            LiquidValue::Object(object)
        }
    }
}

/// Renders prompt templates with a named-variable context, caching compiled
/// templates so repeated stage invocations don't reparse the same string.
pub struct TemplateRenderer {
    parser: Parser,
    cache: RwLock<HashMap<String, Arc<Template>>>,
}

impl TemplateRenderer {
    pub fn new() -> Self {
        Self {
            parser: ParserBuilder::with_stdlib()
                .build()
                .expect("liquid stdlib parser builds"),
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn compile(&self, template_name: &str, template: &str) -> Result<Arc<Template>, TemplateError> {
        if let Some(cached) = self.cache.read().unwrap().get(template) {
            return Ok(cached.clone());
        }
        let parsed = self
            .parser
            .parse(template)
            .map_err(|e| TemplateError {
                template_name: template_name.to_string(),
                message: e.to_string(),
            })?;
        let compiled = Arc::new(parsed);
        self.cache
            .write()
            .unwrap()
            .insert(template.to_string(), compiled.clone());
        Ok(compiled)
    }

    /// `Render(template, vars) → string | TemplateError` (§4.1).
    pub fn render(
        &self,
        template_name: &str,
        template: &str,
        vars: &serde_json::Value,
    ) -> Result<String, TemplateError> {
        let compiled = self.compile(template_name, template)?;
        let object = match json_to_liquid(vars) {
            LiquidValue::Object(object) => object,
            _ => Object::new(),
        };
        compiled.render(&object).map_err(|e| TemplateError {
            template_name: template_name.to_string(),
            message: e.to_string(),
        })
    }

    /// `Validate(template)` — parses without executing.
    pub fn validate(&self, template: &str) -> Result<(), TemplateError> {
        self.parser
            .parse(template)
            .map(|_| ())
            .map_err(|e| TemplateError {
                template_name: "<validate>".to_string(),
                message: e.to_string(),
            })
    }
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new()
    }
}
