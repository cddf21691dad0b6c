//! YAML/JSON configuration documents: parsing, merging and interpolation.
//!
//! Strings may contain `${resolver:arg}` calls (`env`, `cwd`, or any
//! resolver registered on [`Resolvers`]) and `${dotted.path}` references to
//! other nodes of the same document. `\${` escapes a literal `${`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_yaml::{Mapping, Value};

use crate::error::{Error, Result};
use crate::io::storage::{self, Location};

pub type Config = Value;

type ResolverFn = Arc<dyn Fn(&str) -> Result<String> + Send + Sync>;

/// Named interpolation functions.
#[derive(Clone)]
pub struct Resolvers {
    table: BTreeMap<String, ResolverFn>,
}

impl fmt::Debug for Resolvers {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list().entries(self.table.keys()).finish()
    }
}

impl Default for Resolvers {
    fn default() -> Self {
        let mut resolvers = Self { table: BTreeMap::new() };
        let env: ResolverFn = Arc::new(|arg: &str| {
            let (name, default) = match arg.split_once(',') {
                Some((name, default)) => (name.trim(), Some(default.trim())),
                None => (arg.trim(), None),
            };
            match (std::env::var(name), default) {
                (Ok(value), _) => Ok(value),
                (Err(_), Some(default)) => Ok(default.to_string()),
                (Err(_), None) => Err(Error::config(format!("Environment variable '{}' not found", name))),
            }
        });
        resolvers.table.insert("env".to_string(), env.clone());
        resolvers.table.insert("oc.env".to_string(), env);
        resolvers.register("cwd", |_| Ok(std::env::current_dir()?.to_string_lossy().into_owned()));
        resolvers
    }
}

impl Resolvers {
    pub fn register<F>(&mut self, name: &str, resolver: F) -> &mut Self
    where
        F: Fn(&str) -> Result<String> + Send + Sync + 'static,
    {
        self.table.insert(name.to_string(), Arc::new(resolver));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.table.contains_key(name)
    }

    fn call(&self, name: &str, arg: &str) -> Result<String> {
        let resolver = self
            .table
            .get(name)
            .ok_or_else(|| Error::config(format!("Unsupported interpolation type {}", name)))?;
        resolver(arg)
    }
}

pub fn parse_string(text: &str) -> Result<Config> {
    let config: Value = serde_yaml::from_str(text)?;
    Ok(match config {
        Value::Null => Value::Mapping(Mapping::new()),
        other => other,
    })
}

/// Parse a local path, `file://` or `s3://` URI.
pub fn parse_file(path: &str) -> Result<Config> {
    let text = storage::read_to_string(&Location::parse(path)?)?;
    log::debug!("[Configs] parsed {}", path);
    parse_string(&text)
}

fn merge_into(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Mapping(dst), Value::Mapping(src)) => {
            for (key, value) in src {
                match dst.get_mut(&key) {
                    Some(slot) => merge_into(slot, value),
                    None => {
                        dst.insert(key, value);
                    }
                }
            }
        }
        (dst, src) => *dst = src,
    }
}

/// Deep-merge mappings in order; later documents win and sequences are replaced.
pub fn merge_configs<I: IntoIterator<Item = Config>>(configs: I) -> Config {
    let mut merged = Value::Mapping(Mapping::new());
    for config in configs {
        merge_into(&mut merged, config);
    }
    merged
}

fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(root, |node, key| match node {
        Value::Mapping(map) => map.get(key),
        Value::Sequence(seq) => key.parse::<usize>().ok().and_then(|i| seq.get(i)),
        _ => None,
    })
}

const MAX_DEPTH: usize = 32;

fn resolve_expr(expr: &str, root: &Value, resolvers: &Resolvers, depth: usize) -> Result<Value> {
    let expr = expr.trim();
    match expr.split_once(':') {
        Some((name, arg)) if resolvers.contains(name.trim()) || !name.contains('.') => {
            Ok(Value::String(resolvers.call(name.trim(), arg)?))
        }
        _ => {
            let node = lookup(root, expr)
                .ok_or_else(|| Error::config(format!("Interpolation key '{}' not found", expr)))?;
            resolve_node(node, root, resolvers, depth + 1)
        }
    }
}

fn scalar_text(value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Null => Ok("null".to_string()),
        other => Err(Error::config(format!(
            "Cannot interpolate a non-scalar value inside a string: {:?}",
            other
        ))),
    }
}

fn resolve_string(text: &str, root: &Value, resolvers: &Resolvers, depth: usize) -> Result<Value> {
    if depth > MAX_DEPTH {
        return Err(Error::config(format!("Interpolation is too deep (cycle?) in '{}'", text)));
    }
    // A string that is exactly one node reference takes the node's value.
    if let Some(inner) = text.strip_prefix("${").and_then(|t| t.strip_suffix('}')) {
        if !inner.contains("${") && !inner.contains('}') {
            return resolve_expr(inner, root, resolvers, depth);
        }
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("${") {
        if rest[..start].ends_with('\\') {
            out.push_str(&rest[..start - 1]);
            out.push_str("${");
            rest = &rest[start + 2..];
            continue;
        }
        out.push_str(&rest[..start]);
        let end = rest[start..]
            .find('}')
            .ok_or_else(|| Error::config(format!("Unterminated interpolation in '{}'", text)))?;
        let expr = &rest[start + 2..start + end];
        out.push_str(&scalar_text(&resolve_expr(expr, root, resolvers, depth)?)?);
        rest = &rest[start + end + 1..];
    }
    out.push_str(rest);
    Ok(Value::String(out))
}

fn resolve_node(node: &Value, root: &Value, resolvers: &Resolvers, depth: usize) -> Result<Value> {
    match node {
        Value::String(s) if s.contains("${") => resolve_string(s, root, resolvers, depth),
        Value::Mapping(map) => {
            let mut out = Mapping::new();
            for (key, value) in map {
                out.insert(key.clone(), resolve_node(value, root, resolvers, depth)?);
            }
            Ok(Value::Mapping(out))
        }
        Value::Sequence(seq) => Ok(Value::Sequence(
            seq.iter()
                .map(|v| resolve_node(v, root, resolvers, depth))
                .collect::<Result<Vec<_>>>()?,
        )),
        Value::Tagged(tagged) => resolve_node(&tagged.value, root, resolvers, depth),
        other => Ok(other.clone()),
    }
}

/// Resolve every interpolation of `config`.
pub fn to_object(config: &Config, resolvers: &Resolvers) -> Result<Config> {
    resolve_node(config, config, resolvers, 0)
}

/// Resolve `config` and deserialize it into `T`.
pub fn to_settings<T: DeserializeOwned>(config: &Config, resolvers: &Resolvers) -> Result<T> {
    let object = to_object(config, resolvers)?;
    Ok(serde_yaml::from_value(object)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_yaml_and_json_strings() {
        let config = parse_string(r#"{"a": 1, "b": 2, "data": [3, 4]}"#).unwrap();
        assert_eq!(config, parse_string("a: 1\nb: 2\ndata: [3, 4]\n").unwrap());
        assert_eq!(parse_string("").unwrap(), Value::Mapping(Mapping::new()));
    }

    #[test]
    fn later_configs_win_and_mappings_merge() {
        let configs = (0..3).map(|i| parse_string(&format!("x: {i}\n{i}: {i}\nnested: {{k{i}: {i}}}")).unwrap());
        let merged = merge_configs(configs);
        let expected =
            parse_string("x: 2\n0: 0\n1: 1\n2: 2\nnested: {k0: 0, k1: 1, k2: 2}").unwrap();
        assert_eq!(merged, expected);
    }

    #[test]
    fn resolves_custom_env_and_node_references() {
        std::env::set_var("QTO_CONFIGS_TEST_VAR", "from-env");
        let mut resolvers = Resolvers::default();
        resolvers.register("tmp_path", |_| Ok("/tmp/x".to_string()));
        let config = parse_string(
            "uri: ${tmp_path:}/tracking\n\
             env: ${env:QTO_CONFIGS_TEST_VAR}\n\
             fallback: ${env:QTO_CONFIGS_MISSING,dflt}\n\
             base: {n: 3}\n\
             copy: ${base.n}\n\
             literal: \\${kept}\n",
        )
        .unwrap();
        let object = to_object(&config, &resolvers).unwrap();
        assert_eq!(object["uri"], Value::from("/tmp/x/tracking"));
        assert_eq!(object["env"], Value::from("from-env"));
        assert_eq!(object["fallback"], Value::from("dflt"));
        assert_eq!(object["copy"], Value::from(3));
        assert_eq!(object["literal"], Value::from("${kept}"));
    }

    #[test]
    fn unknown_resolver_is_a_configuration_error() {
        let config = parse_string("a: ${nope:x}").unwrap();
        assert!(matches!(
            to_object(&config, &Resolvers::default()),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn parses_local_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        std::fs::write(&path, "a: 1\nb: True\nc: [3, 4]\n").unwrap();
        let config = parse_file(path.to_str().unwrap()).unwrap();
        assert_eq!(config, parse_string("{a: 1, b: true, c: [3, 4]}").unwrap());
    }
}
