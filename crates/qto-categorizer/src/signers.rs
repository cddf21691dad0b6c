//! Model signatures: the column types a saved model expects and returns.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::schemas::{self, Schema};

/// Column types of the signature vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Boolean,
    Integer,
    Long,
    Float,
    Double,
    String,
    Binary,
    Datetime,
}

impl DataType {
    pub fn name(&self) -> &'static str {
        match self {
            DataType::Boolean => "boolean",
            DataType::Integer => "integer",
            DataType::Long => "long",
            DataType::Float => "float",
            DataType::Double => "double",
            DataType::String => "string",
            DataType::Binary => "binary",
            DataType::Datetime => "datetime",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DataType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| Error::value(format!("Unsupported signature type: {}", s)))
    }
}

/// Dataset dtype names and their signature type.
pub const DTYPE_MAPPING: [(&str, DataType); 21] = [
    ("bool", DataType::Boolean),
    ("int", DataType::Long),
    ("int8", DataType::Integer),
    ("int16", DataType::Integer),
    ("int32", DataType::Integer),
    ("int64", DataType::Long),
    ("uint", DataType::Long),
    ("uint8", DataType::Integer),
    ("uint16", DataType::Integer),
    ("uint32", DataType::Integer),
    ("uint64", DataType::Long),
    ("float", DataType::Float),
    ("float16", DataType::Float),
    ("float32", DataType::Float),
    ("float64", DataType::Double),
    ("category", DataType::String),
    ("string", DataType::String),
    ("date", DataType::Datetime),
    ("timestamp", DataType::Datetime),
    ("datetime", DataType::Datetime),
    ("binary", DataType::Binary),
];

pub fn map_dtype(dtype: &str) -> Result<DataType> {
    DTYPE_MAPPING
        .iter()
        .find(|(name, _)| *name == dtype)
        .map(|(_, t)| *t)
        .ok_or_else(|| Error::value(format!("No signature type is mapped for dtype '{}'", dtype)))
}

fn default_required() -> bool {
    true
}

/// One column of a signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ColSpec {
    #[serde(rename = "type")]
    pub dtype: DataType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default = "default_required")]
    pub required: bool,
}

impl ColSpec {
    pub fn new(name: impl Into<String>, dtype: DataType, required: bool) -> Self {
        Self {
            dtype,
            name: Some(name.into()),
            required,
        }
    }
}

/// Input and output column specs of a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub inputs: Vec<ColSpec>,
    pub outputs: Vec<ColSpec>,
}

impl Signature {
    /// Specs serialised as JSON strings, keyed by `inputs` and `outputs`.
    pub fn to_dict(&self) -> Result<BTreeMap<String, String>> {
        let mut dict = BTreeMap::new();
        dict.insert("inputs".to_string(), serde_json::to_string(&self.inputs)?);
        dict.insert("outputs".to_string(), serde_json::to_string(&self.outputs)?);
        Ok(dict)
    }

    pub fn from_dict(dict: &BTreeMap<String, String>) -> Result<Self> {
        let parse = |key: &str| -> Result<Vec<ColSpec>> {
            let raw = dict
                .get(key)
                .ok_or_else(|| Error::value(format!("Signature is missing '{}'", key)))?;
            serde_json::from_str(raw)
                .map_err(|e| Error::value(format!("Invalid signature {} column list: {}", key, e)))
        };
        Ok(Self {
            inputs: parse("inputs")?,
            outputs: parse("outputs")?,
        })
    }

    /// `name -> type` view of the input columns.
    pub fn input_types(&self) -> BTreeMap<String, DataType> {
        self.inputs
            .iter()
            .filter_map(|c| c.name.clone().map(|n| (n, c.dtype)))
            .collect()
    }
}

fn frame_specs(frame: &Frame) -> Result<Vec<ColSpec>> {
    frame
        .columns()
        .iter()
        .map(|c| {
            let dtype = map_dtype(c.dtype.name())?;
            Ok(ColSpec::new(c.name.clone(), dtype, c.null_count() == 0))
        })
        .collect()
}

fn schema_specs(schema: &Schema) -> Result<Vec<ColSpec>> {
    schema
        .fields
        .iter()
        .map(|f| Ok(ColSpec::new(f.name, map_dtype(f.dtype.name())?, !f.nullable)))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "KIND")]
pub enum SignerKind {
    InferSigner(InferSigner),
    ManualSigner(ManualSigner),
    #[serde(alias = "PanderaSigner")]
    SchemaSigner(SchemaSigner),
}

impl Default for SignerKind {
    fn default() -> Self {
        SignerKind::InferSigner(InferSigner::default())
    }
}

impl SignerKind {
    pub fn sign(&self, inputs: &Frame, outputs: &Frame) -> Result<Signature> {
        match self {
            SignerKind::InferSigner(s) => s.sign(inputs, outputs),
            SignerKind::ManualSigner(s) => s.sign(inputs, outputs),
            SignerKind::SchemaSigner(s) => s.sign(inputs, outputs),
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            SignerKind::SchemaSigner(s) => s.validate(),
            _ => Ok(()),
        }
    }
}

/// Derive the signature from the frames themselves.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct InferSigner {}

impl InferSigner {
    pub fn sign(&self, inputs: &Frame, outputs: &Frame) -> Result<Signature> {
        Ok(Signature {
            inputs: frame_specs(inputs)?,
            outputs: frame_specs(outputs)?,
        })
    }
}

/// Signature given explicitly in the configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ManualSigner {
    pub inputs_specs: Vec<ColSpec>,
    pub outputs_specs: Vec<ColSpec>,
}

impl ManualSigner {
    pub fn sign(&self, _inputs: &Frame, _outputs: &Frame) -> Result<Signature> {
        let mut dict = BTreeMap::new();
        dict.insert("inputs".to_string(), serde_json::to_string(&self.inputs_specs)?);
        dict.insert("outputs".to_string(), serde_json::to_string(&self.outputs_specs)?);
        Signature::from_dict(&dict)
    }
}

fn default_inputs_schema_name() -> String {
    "InputsSchema".to_string()
}

fn default_outputs_schema_name() -> String {
    "OutputsSchema".to_string()
}

/// Signature mapped from declared dataset schemas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SchemaSigner {
    #[serde(default = "default_inputs_schema_name")]
    pub inputs_schema_name: String,
    #[serde(default = "default_outputs_schema_name")]
    pub outputs_schema_name: String,
}

impl Default for SchemaSigner {
    fn default() -> Self {
        Self {
            inputs_schema_name: default_inputs_schema_name(),
            outputs_schema_name: default_outputs_schema_name(),
        }
    }
}

fn resolve_schema(name: &str) -> Result<Schema> {
    schemas::by_name(name)
        .ok_or_else(|| Error::value(format!("Schema name was not found in declared schemas. Got: {}.", name)))
}

impl SchemaSigner {
    pub fn validate(&self) -> Result<()> {
        resolve_schema(&self.inputs_schema_name)?;
        resolve_schema(&self.outputs_schema_name)?;
        Ok(())
    }

    pub fn sign(&self, _inputs: &Frame, _outputs: &Frame) -> Result<Signature> {
        Ok(Signature {
            inputs: schema_specs(&resolve_schema(&self.inputs_schema_name)?)?,
            outputs: schema_specs(&resolve_schema(&self.outputs_schema_name)?)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Column;

    fn frames() -> (Frame, Frame) {
        let inputs = Frame::new(vec![
            Column::floats("AMOUNT", &[1.0, 2.0]),
            Column::strings("MERCHANT_NAME", &[Some("A"), None]),
        ])
        .unwrap();
        let outputs = Frame::new(vec![Column::strings("prediction", &[Some("X"), Some("Y")])]).unwrap();
        (inputs, outputs)
    }

    fn as_pairs(specs: &[ColSpec]) -> BTreeMap<String, DataType> {
        specs
            .iter()
            .map(|s| (s.name.clone().unwrap_or_default(), s.dtype))
            .collect()
    }

    #[test]
    fn manual_signer_keeps_given_specs() {
        let (inputs, outputs) = frames();
        let types = [
            DataType::Boolean,
            DataType::Integer,
            DataType::Long,
            DataType::Float,
            DataType::Double,
            DataType::String,
            DataType::Binary,
            DataType::Datetime,
        ];
        let inputs_specs: Vec<ColSpec> = types
            .iter()
            .enumerate()
            .map(|(i, t)| ColSpec::new(format!("c{}", i + 1), *t, true))
            .collect();
        let outputs_specs = vec![ColSpec::new("out", DataType::Long, true)];
        let signer = ManualSigner {
            inputs_specs: inputs_specs.clone(),
            outputs_specs: outputs_specs.clone(),
        };
        let signature = signer.sign(&inputs, &outputs).unwrap();
        assert_eq!(as_pairs(&signature.inputs), as_pairs(&inputs_specs));
        assert_eq!(as_pairs(&signature.outputs), as_pairs(&outputs_specs));
    }

    #[test]
    fn manual_specs_parse_from_config() {
        let signer: SignerKind = serde_json::from_str(
            r#"{"KIND": "ManualSigner",
                "inputs_specs": [{"type": "double", "name": "AMOUNT"}],
                "outputs_specs": [{"type": "string", "name": "prediction"}]}"#,
        )
        .unwrap();
        let (inputs, outputs) = frames();
        let signature = signer.sign(&inputs, &outputs).unwrap();
        assert!(signature.inputs[0].required);
        assert_eq!(signature.inputs[0].dtype, DataType::Double);
    }

    #[test]
    fn infer_signer_reads_frame_dtypes() {
        let (inputs, outputs) = frames();
        let signature = InferSigner::default().sign(&inputs, &outputs).unwrap();
        assert_eq!(signature.inputs[0], ColSpec::new("AMOUNT", DataType::Double, true));
        assert_eq!(signature.inputs[1], ColSpec::new("MERCHANT_NAME", DataType::String, false));
        assert_eq!(signature.outputs[0].dtype, DataType::String);
    }

    #[test]
    fn schema_signer_maps_declared_types() {
        let (inputs, outputs) = frames();
        let signature = SchemaSigner::default().sign(&inputs, &outputs).unwrap();
        let types = signature.input_types();
        assert_eq!(types["AMOUNT"], DataType::Double);
        assert_eq!(types["SIDE"], DataType::Long);
        assert_eq!(types["DATE_EMITTED"], DataType::Datetime);
        assert_eq!(signature.outputs, vec![ColSpec::new("prediction", DataType::String, true)]);
    }

    #[test]
    fn schema_signer_rejects_unknown_schema() {
        let signer = SchemaSigner {
            inputs_schema_name: "BadSchema".into(),
            outputs_schema_name: "BadSchema".into(),
        };
        match signer.validate() {
            Err(Error::Value(msg)) => assert!(msg.contains("Got: BadSchema.")),
            other => panic!("expected a value error, got {:?}", other),
        }
        let (inputs, outputs) = frames();
        assert!(matches!(signer.sign(&inputs, &outputs), Err(Error::Value(_))));
    }

    #[test]
    fn dict_form_is_json_strings() {
        let signature = Signature {
            inputs: vec![ColSpec::new("a", DataType::Long, true)],
            outputs: vec![],
        };
        let dict = signature.to_dict().unwrap();
        assert_eq!(dict["inputs"], r#"[{"type":"long","name":"a","required":true}]"#);
        assert_eq!(Signature::from_dict(&dict).unwrap(), signature);
    }
}
