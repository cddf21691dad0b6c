//! Declared dataset schemas and their validator.
//!
//! Every schema coerces columns to the declared dtype and is strict about
//! extra columns. `Schema::check` collects all failures of a frame and
//! reports them at once; a frame is either fully valid or rejected.

use chrono::{NaiveDate, NaiveDateTime};

use crate::error::{Error, Result, SchemaFailure};
use crate::frame::{Column, DType, Frame, Value};

pub const TRANSACTION_ID: &str = "TRANSACTION_ID";
pub const DATE_EMITTED: &str = "DATE_EMITTED";
pub const AMOUNT: &str = "AMOUNT";
pub const TYPE_OF_PAYMENT: &str = "TYPE_OF_PAYMENT";
pub const MERCHANT_NAME: &str = "MERCHANT_NAME";
pub const DESCRIPTION: &str = "DESCRIPTION";
pub const SIDE: &str = "SIDE";
pub const CATEGORY: &str = "CATEGORY";
pub const PREDICTION: &str = "prediction";

/// Names accepted by [`by_name`].
pub const SCHEMA_NAMES: [&str; 4] = ["InputsSchema", "FeatInputsSchema", "TargetsSchema", "OutputsSchema"];

/// A value constraint on a column.
#[derive(Debug, Clone, PartialEq)]
pub enum Check {
    GreaterThan(f64),
    InRange { min: NaiveDateTime, max: NaiveDateTime },
}

impl Check {
    fn label(&self) -> String {
        match self {
            Check::GreaterThan(v) => format!("greater_than({})", v),
            Check::InRange { min, max } => format!("in_range({}, {})", min, max),
        }
    }

    fn passes(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (Check::GreaterThan(bound), v) => v.as_f64().map(|x| x > *bound).unwrap_or(false),
            (Check::InRange { min, max }, Value::DateTime(dt)) => dt >= min && dt <= max,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: &'static str,
    pub dtype: DType,
    pub nullable: bool,
    pub checks: Vec<Check>,
}

impl Field {
    fn new(name: &'static str, dtype: DType) -> Self {
        Self {
            name,
            dtype,
            nullable: false,
            checks: Vec::new(),
        }
    }

    fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    fn check(mut self, check: Check) -> Self {
        self.checks.push(check);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    pub name: &'static str,
    pub fields: Vec<Field>,
    pub coerce: bool,
    pub strict: bool,
}

impl Schema {
    fn new(name: &'static str, fields: Vec<Field>) -> Self {
        Self {
            name,
            fields,
            coerce: true,
            strict: true,
        }
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn column_names(&self) -> Vec<&'static str> {
        self.fields.iter().map(|f| f.name).collect()
    }

    /// Validate `frame`, returning a coerced copy with columns in declared order.
    pub fn check(&self, frame: &Frame) -> Result<Frame> {
        let mut failures = Vec::new();

        if self.strict {
            for name in frame.column_names() {
                if self.field(name).is_none() {
                    failures.push(SchemaFailure::new(name, "column_in_schema", "column not declared"));
                }
            }
        }

        let mut columns = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            let column = match frame.column(field.name) {
                Some(c) => c,
                None => {
                    failures.push(SchemaFailure::new(field.name, "column_in_dataframe", "column missing"));
                    continue;
                }
            };
            let column = match self.coerce_column(field, column) {
                Ok(c) => c,
                Err(failure) => {
                    failures.push(failure);
                    continue;
                }
            };
            if !field.nullable {
                let nulls = column.null_count();
                if nulls > 0 {
                    failures.push(SchemaFailure::new(
                        field.name,
                        "not_nullable",
                        format!("{} null values", nulls),
                    ));
                }
            }
            for check in &field.checks {
                let bad = column.values.iter().filter(|v| !check.passes(v)).count();
                if bad > 0 {
                    failures.push(SchemaFailure::new(
                        field.name,
                        check.label(),
                        format!("{} failing values", bad),
                    ));
                }
            }
            columns.push(column);
        }

        if !failures.is_empty() {
            log::debug!("[Schemas] {} rejected {} checks", self.name, failures.len());
            return Err(Error::SchemaViolation {
                schema: self.name.to_string(),
                failures,
            });
        }
        Frame::new(columns)
    }

    fn coerce_column(&self, field: &Field, column: &Column) -> std::result::Result<Column, SchemaFailure> {
        if column.dtype == field.dtype {
            return Ok(column.clone());
        }
        if !self.coerce {
            return Err(SchemaFailure::new(
                field.name,
                format!("dtype('{}')", field.dtype),
                format!("found dtype '{}'", column.dtype),
            ));
        }
        column.cast(field.dtype).map_err(|rows| {
            SchemaFailure::new(
                field.name,
                format!("coerce_dtype('{}')", field.dtype),
                format!("{} values could not be coerced, first at row {}", rows.len(), rows[0]),
            )
        })
    }
}

fn date(y: i32, m: u32, d: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(y, m, d)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or_default()
}

/// Raw transactions as exported by the bank.
pub fn inputs_schema() -> Schema {
    Schema::new(
        "InputsSchema",
        vec![
            Field::new(TRANSACTION_ID, DType::Str),
            Field::new(DATE_EMITTED, DType::DateTime).check(Check::InRange {
                min: date(2023, 8, 31),
                max: date(2024, 9, 30),
            }),
            Field::new(AMOUNT, DType::Float).check(Check::GreaterThan(0.0)),
            Field::new(TYPE_OF_PAYMENT, DType::Str).nullable(),
            Field::new(MERCHANT_NAME, DType::Str).nullable(),
            Field::new(DESCRIPTION, DType::Str).nullable(),
            Field::new(SIDE, DType::Int),
            Field::new(CATEGORY, DType::Str),
        ],
    )
}

/// Columns the models consume.
pub fn feat_inputs_schema() -> Schema {
    Schema::new(
        "FeatInputsSchema",
        vec![
            Field::new(AMOUNT, DType::Float).check(Check::GreaterThan(0.0)),
            Field::new(TYPE_OF_PAYMENT, DType::Str).nullable(),
            Field::new(MERCHANT_NAME, DType::Str).nullable(),
            Field::new(DESCRIPTION, DType::Str).nullable(),
        ],
    )
}

pub fn targets_schema() -> Schema {
    Schema::new("TargetsSchema", vec![Field::new(CATEGORY, DType::Str)])
}

pub fn outputs_schema() -> Schema {
    Schema::new("OutputsSchema", vec![Field::new(PREDICTION, DType::Str)])
}

pub fn by_name(name: &str) -> Option<Schema> {
    match name {
        "InputsSchema" => Some(inputs_schema()),
        "FeatInputsSchema" => Some(feat_inputs_schema()),
        "TargetsSchema" => Some(targets_schema()),
        "OutputsSchema" => Some(outputs_schema()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features() -> Frame {
        Frame::new(vec![
            Column::strings(AMOUNT, &[Some("12.5"), Some("3")]),
            Column::strings(TYPE_OF_PAYMENT, &[Some("CARD"), None]),
            Column::strings(MERCHANT_NAME, &[Some("SHOP"), Some("CAFE")]),
            Column::strings(DESCRIPTION, &[None::<&str>, None]),
        ])
        .unwrap()
    }

    #[test]
    fn coerces_and_is_idempotent() {
        let schema = feat_inputs_schema();
        let once = schema.check(&features()).unwrap();
        assert_eq!(once.get(AMOUNT).unwrap().dtype, DType::Float);
        let twice = schema.check(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn collects_every_failure() {
        let mut frame = features();
        frame
            .replace_column(Column::floats(AMOUNT, &[-1.0, 2.0]))
            .unwrap();
        frame.push_column(Column::ints("EXTRA", &[1, 2])).unwrap();
        match feat_inputs_schema().check(&frame) {
            Err(Error::SchemaViolation { schema, failures }) => {
                assert_eq!(schema, "FeatInputsSchema");
                let columns: Vec<&str> = failures.iter().map(|f| f.column.as_str()).collect();
                assert!(columns.contains(&"EXTRA"));
                assert!(columns.contains(&AMOUNT));
            }
            other => panic!("expected a schema violation, got {:?}", other),
        }
    }

    #[test]
    fn rejects_uncoercible_values() {
        let mut frame = features();
        frame
            .replace_column(Column::strings(AMOUNT, &[Some("abc"), Some("1")]))
            .unwrap();
        assert!(matches!(
            feat_inputs_schema().check(&frame),
            Err(Error::SchemaViolation { .. })
        ));
    }

    #[test]
    fn resolves_declared_names_only() {
        for name in SCHEMA_NAMES {
            assert_eq!(by_name(name).unwrap().name, name);
        }
        assert!(by_name("MissingSchema").is_none());
    }
}
