//! Specification document parsing.
//!
//! [`DocumentParser`] is the collaborator seam; [`StructuredDocumentParser`]
//! handles YAML, JSON, Markdown and plain text. [`merge_documents`] folds the
//! per-document facts into one hardware description plus deduplicated
//! capability and requirement lists.

use std::collections::{BTreeMap, HashSet};

use phoenix_types::{Capability, HardwareSpec, Requirement, Severity, VerifyError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("{document}: binary content is not a specification document")]
    Binary { document: String },

    #[error("{document}: {message}")]
    Syntax { document: String, message: String },

    #[error("{document}: invalid {field}: {message}")]
    InvalidField {
        document: String,
        field: String,
        message: String,
    },
}

impl From<ParseError> for VerifyError {
    fn from(e: ParseError) -> Self {
        VerifyError::Validation(e.to_string())
    }
}

/// A named document as supplied by the caller.
#[derive(Debug, Clone)]
pub struct SpecDocument {
    pub name: String,
    pub content: Vec<u8>,
}

impl SpecDocument {
    pub fn new(name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    Yaml,
    Json,
    Markdown,
    Text,
}

impl DocumentFormat {
    pub fn from_name(name: &str) -> Self {
        let ext = name.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("yaml" | "yml") => Self::Yaml,
            Some("json") => Self::Json,
            Some("md") => Self::Markdown,
            _ => Self::Text,
        }
    }
}

/// Hardware facts stated by one document. Absent facts stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HardwareFacts {
    pub soc: Option<String>,
    pub vendor: Option<String>,
    pub architecture: Option<String>,
    pub cpu_type: Option<String>,
    pub cpu_cores: Option<u32>,
    pub cpu_frequency_mhz: Option<u32>,
    pub memory_type: Option<String>,
    pub memory_mb: Option<u64>,
    pub flash_type: Option<String>,
    pub flash_mb: Option<u64>,
    pub interfaces: Vec<Value>,
    pub peripherals: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedDocument {
    pub name: String,
    pub format: DocumentFormat,
    pub title: Option<String>,
    pub capabilities: Vec<Capability>,
    pub requirements: Vec<Requirement>,
    pub hardware: HardwareFacts,
}

/// Extracts capabilities, requirements and hardware facts from a document.
pub trait DocumentParser: Send + Sync {
    fn parse(&self, document: &SpecDocument) -> Result<ParsedDocument, ParseError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StructuredDocumentParser;

impl DocumentParser for StructuredDocumentParser {
    fn parse(&self, document: &SpecDocument) -> Result<ParsedDocument, ParseError> {
        let name = document.name.as_str();
        let text = decode_text(name, &document.content)?;
        let format = DocumentFormat::from_name(name);

        let root = match format {
            DocumentFormat::Yaml => {
                let v: Value = serde_yaml_ng::from_str(&text).map_err(|e| syntax(name, e))?;
                if v.is_null() {
                    json!({})
                } else {
                    v
                }
            }
            DocumentFormat::Json => serde_json::from_str(&text).map_err(|e| syntax(name, e))?,
            DocumentFormat::Markdown => markdown_to_value(&text),
            DocumentFormat::Text => json!({}),
        };
        let Value::Object(root) = root else {
            return Err(ParseError::Syntax {
                document: name.to_string(),
                message: "top level must be a mapping".into(),
            });
        };

        let fields = Fields { document: name, root: &root };
        Ok(ParsedDocument {
            name: name.to_string(),
            format,
            title: fields.string(&["title", "name"]),
            capabilities: fields.capabilities(),
            requirements: fields.requirements()?,
            hardware: fields.hardware()?,
        })
    }
}

/// UTF-8 with a Latin-1 fallback. NUL bytes mean binary content.
pub fn decode_text(document: &str, bytes: &[u8]) -> Result<String, ParseError> {
    if bytes.contains(&0) {
        return Err(ParseError::Binary {
            document: document.to_string(),
        });
    }
    match std::str::from_utf8(bytes) {
        Ok(s) => Ok(s.to_string()),
        Err(_) => Ok(bytes.iter().map(|&b| char::from(b)).collect()),
    }
}

fn syntax(document: &str, e: impl std::fmt::Display) -> ParseError {
    ParseError::Syntax {
        document: document.to_string(),
        message: e.to_string(),
    }
}

/// `# ` sets the title; bullets that say shall/must are requirements, bullets
/// that mention support/feature are capabilities.
fn markdown_to_value(text: &str) -> Value {
    let mut title = None;
    let mut capabilities = Vec::new();
    let mut requirements = Vec::new();

    for line in text.lines() {
        if let Some(t) = line.strip_prefix("# ") {
            title = Some(t.trim().to_string());
        } else if let Some(item) = line.strip_prefix("- ").or_else(|| line.strip_prefix("* ")) {
            let item = item.trim();
            let lower = item.to_lowercase();
            if lower.contains("shall") || lower.contains("must") {
                requirements.push(Value::String(item.to_string()));
            } else if lower.contains("support") || lower.contains("feature") {
                capabilities.push(Value::String(item.to_string()));
            }
        }
    }

    let mut root = Map::new();
    if let Some(t) = title {
        root.insert("title".into(), Value::String(t));
    }
    root.insert("capabilities".into(), Value::Array(capabilities));
    root.insert("requirements".into(), Value::Array(requirements));
    Value::Object(root)
}

// ── Field extraction ─────────────────────────────────────────────────

struct Fields<'a> {
    document: &'a str,
    root: &'a Map<String, Value>,
}

impl<'a> Fields<'a> {
    fn invalid(&self, field: &str, message: impl Into<String>) -> ParseError {
        ParseError::InvalidField {
            document: self.document.to_string(),
            field: field.to_string(),
            message: message.into(),
        }
    }

    fn first(&self, keys: &[&str]) -> Option<&'a Value> {
        keys.iter().find_map(|k| self.root.get(*k))
    }

    fn string(&self, keys: &[&str]) -> Option<String> {
        self.first(keys).and_then(scalar_string)
    }

    fn capabilities(&self) -> Vec<Capability> {
        let mut out = Vec::new();

        if let Some(Value::Array(items)) = self.first(&["capabilities", "features"]) {
            for (i, item) in items.iter().enumerate() {
                let fallback_id = format!("CAP_{:03}", i + 1);
                match item {
                    Value::Object(obj) => out.push(Capability {
                        id: obj_string(obj, &["id", "capability_id"]).unwrap_or(fallback_id),
                        name: obj_string(obj, &["name", "title"])
                            .unwrap_or_else(|| format!("Capability {}", i + 1)),
                        category: obj_string(obj, &["category"]).unwrap_or_else(|| "general".into()),
                        description: obj_string(obj, &["description"]).unwrap_or_default(),
                        testable: obj.get("testable").and_then(Value::as_bool).unwrap_or(true),
                        parameters: obj
                            .get("parameters")
                            .or_else(|| obj.get("params"))
                            .and_then(Value::as_object)
                            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                            .unwrap_or_default(),
                    }),
                    Value::String(s) => out.push(Capability {
                        id: fallback_id,
                        name: s.clone(),
                        category: "general".into(),
                        description: s.clone(),
                        testable: true,
                        parameters: BTreeMap::new(),
                    }),
                    _ => {}
                }
            }
        }

        if let Some(Value::Object(components)) = self.first(&["hardware", "components"]) {
            for (name, data) in components {
                if let Value::Object(params) = data {
                    out.push(Capability {
                        id: format!("HW_{}", name.to_ascii_uppercase()),
                        name: name.clone(),
                        category: "hardware".into(),
                        description: data.to_string(),
                        testable: true,
                        parameters: params.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                    });
                }
            }
        }
        out
    }

    fn requirements(&self) -> Result<Vec<Requirement>, ParseError> {
        let Some(Value::Array(items)) = self.first(&["requirements", "specs"]) else {
            return Ok(Vec::new());
        };

        let mut out = Vec::new();
        for (i, item) in items.iter().enumerate() {
            let fallback_id = format!("REQ_{:03}", i + 1);
            match item {
                Value::Object(obj) => {
                    let severity = match obj_string(obj, &["severity"]) {
                        None => Severity::Medium,
                        Some(s) => Severity::parse(&s)
                            .ok_or_else(|| self.invalid("severity", format!("unknown severity '{s}'")))?,
                    };
                    out.push(Requirement {
                        id: obj_string(obj, &["id"]).unwrap_or(fallback_id),
                        title: obj_string(obj, &["title", "name"])
                            .unwrap_or_else(|| format!("Requirement {}", i + 1)),
                        description: obj_string(obj, &["description"]).unwrap_or_default(),
                        category: obj_string(obj, &["category"]).unwrap_or_else(|| "functional".into()),
                        severity,
                        acceptance_criteria: string_list(
                            obj.get("acceptance_criteria").or_else(|| obj.get("criteria")),
                        ),
                        linked_capabilities: string_list(obj.get("linked_capabilities")),
                    });
                }
                Value::String(s) => {
                    let lower = s.to_lowercase();
                    let severity = if lower.contains("critical") || lower.contains("must") {
                        Severity::Critical
                    } else if lower.contains("should") {
                        Severity::High
                    } else {
                        Severity::Medium
                    };
                    out.push(Requirement {
                        id: fallback_id,
                        title: truncate_title(s),
                        description: s.clone(),
                        category: "functional".into(),
                        severity,
                        acceptance_criteria: Vec::new(),
                        linked_capabilities: Vec::new(),
                    });
                }
                _ => {}
            }
        }
        Ok(out)
    }

    fn hardware(&self) -> Result<HardwareFacts, ParseError> {
        let cpu = self.root.get("cpu").and_then(Value::as_object);
        let memory = self.root.get("memory").and_then(Value::as_object);
        let flash = self.root.get("flash").and_then(Value::as_object);

        Ok(HardwareFacts {
            soc: self.string(&["soc", "soc_id"]),
            vendor: self.string(&["vendor"]),
            architecture: self.string(&["architecture"]),
            cpu_type: nested(cpu, "type")
                .or_else(|| self.root.get("cpu_type"))
                .and_then(scalar_string),
            cpu_cores: self.number("cpu.cores", nested(cpu, "cores").or_else(|| self.root.get("cpu_cores")))?,
            cpu_frequency_mhz: self.number("cpu.frequency_mhz", nested(cpu, "frequency_mhz"))?,
            memory_type: nested(memory, "type").and_then(scalar_string),
            memory_mb: self.number(
                "memory.size_mb",
                nested(memory, "size_mb").or_else(|| self.root.get("memory_mb")),
            )?,
            flash_type: nested(flash, "type").and_then(scalar_string),
            flash_mb: self.number(
                "flash.size_mb",
                nested(flash, "size_mb").or_else(|| self.root.get("flash_mb")),
            )?,
            interfaces: self
                .root
                .get("interfaces")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            peripherals: self
                .root
                .get("peripherals")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
        })
    }

    /// A non-negative integer given as a number or numeric string.
    fn number<T: TryFrom<u64>>(&self, field: &str, value: Option<&Value>) -> Result<Option<T>, ParseError> {
        let Some(value) = value else {
            return Ok(None);
        };
        let n = match value {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse::<u64>().ok(),
            _ => None,
        };
        n.and_then(|n| T::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| self.invalid(field, format!("expected a non-negative integer, got {value}")))
    }
}

fn nested<'m>(obj: Option<&'m Map<String, Value>>, key: &str) -> Option<&'m Value> {
    obj.and_then(|o| o.get(key))
}

fn scalar_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn obj_string(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| obj.get(*k)).and_then(scalar_string)
}

fn string_list(v: Option<&Value>) -> Vec<String> {
    match v {
        Some(Value::Array(items)) => items
            .iter()
            .map(|i| scalar_string(i).unwrap_or_else(|| i.to_string()))
            .collect(),
        Some(Value::String(s)) => vec![s.clone()],
        _ => Vec::new(),
    }
}

fn truncate_title(s: &str) -> String {
    if s.chars().count() > 50 {
        let head: String = s.chars().take(50).collect();
        format!("{head}...")
    } else {
        s.to_string()
    }
}

// ── Merging ──────────────────────────────────────────────────────────

/// Facts merged across every successfully parsed document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedSpec {
    pub capabilities: Vec<Capability>,
    pub requirements: Vec<Requirement>,
    pub hardware: HardwareSpec,
    pub source_documents: Vec<String>,
}

/// Concatenate capabilities and requirements (first id wins) and overlay
/// hardware facts in document order. Unstated facts keep their defaults.
pub fn merge_documents(docs: &[ParsedDocument]) -> MergedSpec {
    let mut hw = HardwareSpec::default();
    let mut capabilities = Vec::new();
    let mut requirements = Vec::new();
    let mut cap_ids = HashSet::new();
    let mut req_ids = HashSet::new();

    fn known(v: &Option<String>) -> Option<String> {
        v.as_ref().filter(|s| !s.is_empty() && *s != "unknown").cloned()
    }

    for doc in docs {
        for cap in &doc.capabilities {
            if cap_ids.insert(cap.id.clone()) {
                capabilities.push(cap.clone());
            }
        }
        for req in &doc.requirements {
            if req_ids.insert(req.id.clone()) {
                requirements.push(req.clone());
            }
        }

        let f = &doc.hardware;
        if let Some(v) = known(&f.soc) {
            hw.soc = v;
        }
        if let Some(v) = known(&f.vendor) {
            hw.vendor = v;
        }
        if let Some(v) = known(&f.architecture) {
            hw.architecture = v;
        }
        if let Some(v) = known(&f.cpu_type) {
            hw.cpu.cpu_type = v;
        }
        if let Some(v) = f.cpu_cores.filter(|n| *n > 0) {
            hw.cpu.cores = v;
        }
        if let Some(v) = f.cpu_frequency_mhz.filter(|n| *n > 0) {
            hw.cpu.frequency_mhz = v;
        }
        if let Some(v) = known(&f.memory_type) {
            hw.memory.kind = v;
        }
        if let Some(v) = f.memory_mb.filter(|n| *n > 0) {
            hw.memory.size_mb = v;
        }
        if let Some(v) = known(&f.flash_type) {
            hw.flash.kind = v;
        }
        if let Some(v) = f.flash_mb.filter(|n| *n > 0) {
            hw.flash.size_mb = v;
        }
        if !f.interfaces.is_empty() {
            hw.interfaces = f.interfaces.clone();
        }
        if !f.peripherals.is_empty() {
            hw.peripherals = f.peripherals.clone();
        }
    }

    MergedSpec {
        capabilities,
        requirements,
        hardware: hw,
        source_documents: docs.iter().map(|d| d.name.clone()).collect(),
    }
}
