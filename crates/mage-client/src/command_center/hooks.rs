//! Batch header hooks.

use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// A hook sees the serialized parameter line of every command in the batch
/// and may contribute one header fragment.
pub type Hook = Arc<dyn Fn(&[String]) -> Option<Map<String, Value>> + Send + Sync>;

/// Ordered `name → hook` mapping.
#[derive(Clone, Default)]
pub struct HookRegistry {
    hooks: Vec<(String, Hook)>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a hook. A replaced hook keeps its position.
    pub fn register(&mut self, name: impl Into<String>, hook: Hook) {
        let name = name.into();
        match self.hooks.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, slot)) => *slot = hook,
            None => self.hooks.push((name, hook)),
        }
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        let before = self.hooks.len();
        self.hooks.retain(|(existing, _)| existing != name);
        self.hooks.len() != before
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Run every hook once and collect the header array.
    ///
    /// Each fragment is tagged with its hook's name under `"name"`.
    pub fn build_header(&self, params: &[String]) -> Vec<Value> {
        self.hooks
            .iter()
            .filter_map(|(name, hook)| {
                let mut fragment = hook(params)?;
                fragment.insert("name".to_string(), Value::String(name.clone()));
                Some(Value::Object(fragment))
            })
            .collect()
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.hooks.iter().map(|(name, _)| name.as_str()).collect();
        f.debug_struct("HookRegistry").field("hooks", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fragment(key: &str, value: &str) -> Hook {
        let (key, value) = (key.to_string(), value.to_string());
        Arc::new(move |_| {
            let mut map = Map::new();
            map.insert(key.clone(), Value::String(value.clone()));
            Some(map)
        })
    }

    #[test]
    fn test_header_tags_fragments() {
        let mut hooks = HookRegistry::new();
        hooks.register("auth", fragment("token", "x"));
        hooks.register("silent", Arc::new(|_| None));

        let header = hooks.build_header(&["[]".to_string()]);
        assert_eq!(header, vec![json!({ "name": "auth", "token": "x" })]);
    }

    #[test]
    fn test_replace_keeps_position() {
        let mut hooks = HookRegistry::new();
        hooks.register("a", fragment("v", "1"));
        hooks.register("b", fragment("v", "2"));
        hooks.register("a", fragment("v", "3"));

        let header = hooks.build_header(&[]);
        assert_eq!(
            header,
            vec![json!({ "name": "a", "v": "3" }), json!({ "name": "b", "v": "2" })]
        );
    }

    #[test]
    fn test_hook_sees_params() {
        let mut hooks = HookRegistry::new();
        hooks.register(
            "count",
            Arc::new(|params: &[String]| {
                let mut map = Map::new();
                map.insert("commands".into(), json!(params.len()));
                Some(map)
            }),
        );

        let header = hooks.build_header(&["[1]".into(), "[2]".into()]);
        assert_eq!(header, vec![json!({ "name": "count", "commands": 2 })]);
    }

    #[test]
    fn test_unregister() {
        let mut hooks = HookRegistry::new();
        hooks.register("a", fragment("v", "1"));
        assert!(hooks.unregister("a"));
        assert!(!hooks.unregister("a"));
        assert!(hooks.is_empty());
        assert!(hooks.build_header(&[]).is_empty());
    }
}
