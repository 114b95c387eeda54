//! Typed evidence descriptors: path derivation, partitioning, and the
//! JSON-canonicalization + signing rules applied at write time.

use anyhow::{Context, Result, anyhow, bail};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::agent::Agent;
use crate::config::Config;

/// The root directory and default TTL an evidence's kind determines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Raw,
    Derived,
    Report,
    Tmp,
    External,
}

impl Kind {
    pub fn dirname(self) -> &'static str {
        match self {
            Kind::Raw => "raw",
            Kind::Derived => "derived",
            Kind::Report => "reports",
            Kind::Tmp => "tmp",
            Kind::External => "external",
        }
    }

    pub fn default_ttl(self) -> u64 {
        match self {
            Kind::External => 60 * 60 * 24 * 365,
            _ => 60 * 60 * 24,
        }
    }

    pub fn from_dirname(dirname: &str) -> Option<Self> {
        match dirname {
            "raw" => Some(Kind::Raw),
            "derived" => Some(Kind::Derived),
            "reports" => Some(Kind::Report),
            "tmp" => Some(Kind::Tmp),
            "external" => Some(Kind::External),
            _ => None,
        }
    }
}

/// A single evidence descriptor/instance.
#[derive(Debug, Clone)]
pub struct Evidence {
    pub kind: Kind,
    pub category: String,
    pub name: String,
    pub ttl: u64,
    pub description: String,
    pub content: Option<Vec<u8>>,
    pub binary_content: bool,
    pub digest: Option<String>,
    pub signature: Option<String>,
    pub agent: Option<String>,
    pub partition_fields: Option<Vec<String>>,
    pub partition_root: Option<String>,
    /// Set by multi-locker fallback to the locker that actually served this
    /// evidence, when it wasn't the primary.
    pub locker: Option<String>,
}

impl Evidence {
    pub fn new(kind: Kind, category: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            category: category.into(),
            name: name.into(),
            ttl: kind.default_ttl(),
            description: String::new(),
            content: None,
            binary_content: false,
            digest: None,
            signature: None,
            agent: None,
            partition_fields: None,
            partition_root: None,
            locker: None,
        }
    }

    pub fn is_partitioned(&self) -> bool {
        self.kind == Kind::Raw && self.partition_fields.is_some()
    }

    /// Substitute `{{dotted.path}}` placeholders in `name` from `cfg`.
    pub fn resolved_name(&self, cfg: &Config) -> String {
        substitute_template(&self.name, cfg)
    }

    /// `[agents/<agent>/]<kind>/<category>`
    pub fn dir_path(&self, cfg: &Config) -> String {
        match &self.agent {
            Some(agent) => format!("agents/{agent}/{}/{}", self.kind.dirname(), self.category),
            None => format!("{}/{}", self.kind.dirname(), self.category),
        }
    }

    /// `[agents/<agent>/]<kind>/<category>/<name>`
    pub fn path(&self, cfg: &Config) -> String {
        format!("{}/{}", self.dir_path(cfg), self.resolved_name(cfg))
    }

    fn is_json_name(&self) -> bool {
        self.name.ends_with(".json")
    }

    /// Store content, canonicalizing JSON and, if requested and an agent is
    /// attached with a private key, signing the canonical bytes.
    pub fn set_content(
        &mut self,
        content: Option<Vec<u8>>,
        sign: bool,
        agent: Option<&Agent>,
    ) -> Result<()> {
        let Some(raw) = content else {
            self.content = None;
            self.digest = None;
            self.signature = None;
            return Ok(());
        };

        let canonical = if self.is_json_name() {
            let parsed: Value = serde_json::from_slice(&raw)
                .with_context(|| format!("evidence {} is not valid JSON", self.name))?;
            canonicalize_json(&parsed)
        } else {
            raw
        };

        if sign {
            if let Some(agent) = agent {
                if agent.signable() {
                    let (digest, signature) = agent.hash_and_sign(&canonical)?;
                    self.digest = Some(digest);
                    self.signature = Some(signature);
                }
            }
        }

        self.content = Some(canonical);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        match &self.content {
            None => true,
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                if text.trim().is_empty() {
                    return true;
                }
                if self.is_json_name() {
                    if let Ok(value) = serde_json::from_slice::<Value>(bytes) {
                        return is_empty_container(&value);
                    }
                }
                false
            }
        }
    }

    /// Fail for non-JSON-named evidence.
    pub fn content_as_json(&self) -> Result<Value> {
        if !self.is_json_name() {
            bail!("evidence {} does not have a .json extension; content_as_json unavailable", self.name);
        }
        let bytes = self.content.as_deref().unwrap_or(b"null");
        serde_json::from_slice(bytes).with_context(|| format!("evidence {} is not valid JSON", self.name))
    }

    /// Distinct partition-key tuples, deduplicated and stable within a run.
    pub fn partition_keys(&self) -> Result<Vec<Vec<Value>>> {
        let fields = self
            .partition_fields
            .as_ref()
            .ok_or_else(|| anyhow!("evidence {} is not partitioned", self.name))?;
        let doc = self.content_as_json()?;
        let items = list_at_root(&doc, self.partition_root.as_deref())
            .ok_or_else(|| anyhow!("partition_root does not resolve to a list in {}", self.name))?;

        let mut seen = Vec::new();
        for item in items {
            let tuple: Vec<Value> = fields.iter().map(|f| get_dotted(item, f)).collect();
            if !seen.contains(&tuple) {
                seen.push(tuple);
            }
        }
        Ok(seen)
    }

    /// The document containing only the subset at `partition_root` whose
    /// field tuple equals `key`, surrounding structure preserved.
    pub fn get_partition(&self, key: &[Value]) -> Result<Value> {
        let fields = self
            .partition_fields
            .as_ref()
            .ok_or_else(|| anyhow!("evidence {} is not partitioned", self.name))?;
        let doc = self.content_as_json()?;
        let items = list_at_root(&doc, self.partition_root.as_deref())
            .ok_or_else(|| anyhow!("partition_root does not resolve to a list in {}", self.name))?;

        let filtered: Vec<Value> = items
            .iter()
            .filter(|item| {
                let tuple: Vec<Value> = fields.iter().map(|f| get_dotted(item, f)).collect();
                tuple == key
            })
            .cloned()
            .collect();

        Ok(set_at_root(doc, self.partition_root.as_deref(), Value::Array(filtered)))
    }

    /// A stable plaintext block wrapping agent name, content, digest, and
    /// signature with BEGIN/END markers, used by signature tooling.
    pub fn clear_sign(&self) -> Option<String> {
        let digest = self.digest.as_ref()?;
        let signature = self.signature.as_ref()?;
        let agent = self.agent.as_deref().unwrap_or("");
        let content = self
            .content
            .as_ref()
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .unwrap_or_default();
        Some(format!(
            "-----BEGIN EVIDENCE-----\nagent: {agent}\ndigest: {digest}\nsignature: {signature}\n{content}\n-----END EVIDENCE-----\n"
        ))
    }
}

/// `"{{locker.branch}}"` style placeholder substitution against config.
fn substitute_template(name: &str, cfg: &Config) -> String {
    let mut out = String::with_capacity(name.len());
    let mut rest = name;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };
        let key = after[..end].trim();
        if let Some(value) = cfg.get_str(key) {
            out.push_str(&value);
        } else if let Some(value) = cfg.get(key) {
            out.push_str(&value_to_plain_string(&value));
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    out
}

fn value_to_plain_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Pretty JSON with 2-space indent and sorted keys (serde_json's default
/// `Map` is a `BTreeMap`, so keys are already sorted without a
/// `preserve_order` feature) — the canonical encoding evidence digests and
/// signatures are computed over.
fn canonicalize_json(value: &Value) -> Vec<u8> {
    let sorted = sort_value(value.clone());
    serde_json::to_vec_pretty(&sorted).expect("Value serialization cannot fail")
}

fn sort_value(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted = Map::new();
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            for key in keys {
                if let Some(v) = map.get(&key) {
                    sorted.insert(key, sort_value(v.clone()));
                }
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_value).collect()),
        other => other,
    }
}

fn is_empty_container(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::Number(_) | Value::Bool(_) => false,
    }
}

fn list_at_root<'a>(doc: &'a Value, root: Option<&str>) -> Option<&'a Vec<Value>> {
    match root {
        None => doc.as_array(),
        Some(path) => get_dotted_ref(doc, path)?.as_array(),
    }
}

fn set_at_root(doc: Value, root: Option<&str>, replacement: Value) -> Value {
    match root {
        None => replacement,
        Some(path) => {
            let mut doc = doc;
            set_dotted(&mut doc, path, replacement);
            doc
        }
    }
}

fn get_dotted(value: &Value, path: &str) -> Value {
    get_dotted_ref(value, path).cloned().unwrap_or(Value::Null)
}

fn get_dotted_ref<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cur = value;
    for segment in path.split('.') {
        cur = cur.get(segment)?;
    }
    Some(cur)
}

fn set_dotted(value: &mut Value, path: &str, new_value: Value) {
    let segments: Vec<&str> = path.split('.').collect();
    let mut cur = value;
    for segment in &segments[..segments.len() - 1] {
        if !cur.is_object() {
            *cur = Value::Object(Map::new());
        }
        cur = cur.as_object_mut().unwrap().entry(segment.to_string()).or_insert(Value::Object(Map::new()));
    }
    if let Some(last) = segments.last() {
        if !cur.is_object() {
            *cur = Value::Object(Map::new());
        }
        cur.as_object_mut().unwrap().insert(last.to_string(), new_value);
    }
}

/// First 10 hex characters of the SHA-256 digest of a partition key tuple:
/// the digest of each part's plain string form, concatenated in order (not
/// the JSON encoding of the tuple).
pub fn partition_hash(key: &[Value]) -> String {
    let mut hasher = Sha256::new();
    for part in key {
        hasher.update(value_to_plain_string(part).as_bytes());
    }
    let digest = hasher.finalize();
    hex::encode(digest)[..10].to_string()
}

/// Render a JSON value as its plain, unquoted string form, for hashing
/// partition key parts (`"x"` hashes as `x`, not `"x"`).
fn value_to_plain_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => if *b { "True".to_string() } else { "False".to_string() },
        Value::Null => "None".to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn cfg() -> Config {
        Config::from_value(json!({}))
    }

    #[test]
    fn path_without_agent() {
        let ev = Evidence::new(Kind::Raw, "ppl", "people.json");
        assert_eq!(ev.path(&cfg()), "raw/ppl/people.json");
    }

    #[test]
    fn path_with_agent_prefix() {
        let mut ev = Evidence::new(Kind::Raw, "ppl", "people.json");
        ev.agent = Some("auditree.local".into());
        assert_eq!(ev.path(&cfg()), "agents/auditree.local/raw/ppl/people.json");
    }

    #[test]
    fn set_content_canonicalizes_json() {
        let mut ev = Evidence::new(Kind::Raw, "x", "y.json");
        ev.set_content(Some(br#"{"b":1,"a":2}"#.to_vec()), false, None).unwrap();
        let text = String::from_utf8(ev.content.clone().unwrap()).unwrap();
        assert!(text.find("\"a\"").unwrap() < text.find("\"b\"").unwrap());
    }

    #[test]
    fn set_content_none_is_not_signed() {
        let mut ev = Evidence::new(Kind::Raw, "x", "y.txt");
        ev.set_content(None, true, None).unwrap();
        assert!(ev.content.is_none());
        assert!(ev.digest.is_none());
    }

    #[test]
    fn is_empty_for_missing_content() {
        let ev = Evidence::new(Kind::Raw, "x", "y.txt");
        assert!(ev.is_empty());
    }

    #[test]
    fn is_empty_for_empty_json_array_but_not_zero() {
        let mut ev = Evidence::new(Kind::Raw, "x", "y.json");
        ev.set_content(Some(b"[]".to_vec()), false, None).unwrap();
        assert!(ev.is_empty());

        let mut ev_zero = Evidence::new(Kind::Raw, "x", "z.json");
        ev_zero.set_content(Some(b"0".to_vec()), false, None).unwrap();
        assert!(!ev_zero.is_empty());
    }

    #[test]
    fn content_as_json_rejects_non_json_extension() {
        let ev = Evidence::new(Kind::Raw, "x", "y.txt");
        assert!(ev.content_as_json().is_err());
    }

    #[test]
    fn partition_keys_deduplicates() {
        let mut ev = Evidence::new(Kind::Raw, "ppl", "people.json");
        ev.partition_fields = Some(vec!["lname".into()]);
        ev.set_content(
            Some(
                br#"[{"fname":"jeff","lname":"lebowski"},{"fname":"walter","lname":"sobchak"},{"fname":"donny","lname":"sobchak"}]"#
                    .to_vec(),
            ),
            false,
            None,
        )
        .unwrap();

        let keys = ev.partition_keys().unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&vec![json!("lebowski")]));
        assert!(keys.contains(&vec![json!("sobchak")]));
    }

    #[test]
    fn get_partition_returns_matching_subset() {
        let mut ev = Evidence::new(Kind::Raw, "ppl", "people.json");
        ev.partition_fields = Some(vec!["lname".into()]);
        ev.set_content(
            Some(
                br#"[{"fname":"jeff","lname":"lebowski"},{"fname":"walter","lname":"sobchak"}]"#.to_vec(),
            ),
            false,
            None,
        )
        .unwrap();

        let subset = ev.get_partition(&[json!("lebowski")]).unwrap();
        assert_eq!(subset, json!([{"fname":"jeff","lname":"lebowski"}]));
    }

    #[test]
    fn partition_hash_is_ten_hex_chars() {
        let hash = partition_hash(&[json!("lebowski")]);
        assert_eq!(hash.len(), 10);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash, "f60fa4f29c");
    }

    #[test]
    fn partition_hash_concatenates_parts_rather_than_json_encoding() {
        // "foo" + "bar" hashed as the concatenated string "foobar", not as
        // the two-element JSON array `["foo","bar"]`.
        let combined = partition_hash(&[json!("foo"), json!("bar")]);
        let single = partition_hash(&[json!("foobar")]);
        assert_eq!(combined, single);
    }

    #[test]
    fn resolved_name_substitutes_config_values() {
        let cfg = Config::from_value(json!({"org": {"name": "acme"}}));
        let ev = Evidence::new(Kind::Raw, "x", "{{org.name}}.json");
        assert_eq!(ev.resolved_name(&cfg), "acme.json");
    }
}
