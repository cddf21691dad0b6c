//! Flat parquet files and Hive-style parquet directories.

use std::sync::Arc;

use bytes::Bytes;
use chrono::NaiveDateTime;
use parquet::basic::{
    Compression as CompressionCodec, ConvertedType, GzipLevel, LogicalType, Repetition, TimeUnit,
    Type as PhysicalType,
};
use parquet::data_type::{BoolType, ByteArray, ByteArrayType, DoubleType, Int64Type};
use parquet::file::properties::WriterProperties;
use parquet::file::reader::{FileReader, SerializedFileReader};
use parquet::file::writer::SerializedFileWriter;
use parquet::format::MicroSeconds;
use parquet::record::Field;
use parquet::schema::types::{ColumnDescriptor, Type};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::frame::{Column, DType, Frame, Value};
use crate::io::storage::{self, Location};

/// Page compression used when writing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    Uncompressed,
    #[default]
    Snappy,
    Gzip,
}

impl Compression {
    fn codec(&self) -> CompressionCodec {
        match self {
            Compression::Uncompressed => CompressionCodec::UNCOMPRESSED,
            Compression::Snappy => CompressionCodec::SNAPPY,
            Compression::Gzip => CompressionCodec::GZIP(GzipLevel::default()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Stamp {
    Millis,
    Micros,
    Nanos,
}

fn column_dtype(col: &ColumnDescriptor) -> (DType, Option<Stamp>) {
    let stamp = match col.logical_type() {
        Some(LogicalType::Timestamp { unit, .. }) => Some(match unit {
            TimeUnit::MILLIS(_) => Stamp::Millis,
            TimeUnit::MICROS(_) => Stamp::Micros,
            TimeUnit::NANOS(_) => Stamp::Nanos,
        }),
        Some(LogicalType::Date) => Some(Stamp::Millis),
        _ => match col.converted_type() {
            ConvertedType::TIMESTAMP_MILLIS | ConvertedType::DATE => Some(Stamp::Millis),
            ConvertedType::TIMESTAMP_MICROS => Some(Stamp::Micros),
            _ => None,
        },
    };
    let dtype = match col.physical_type() {
        PhysicalType::BOOLEAN => DType::Bool,
        PhysicalType::INT32 | PhysicalType::INT64 if stamp.is_some() => DType::DateTime,
        PhysicalType::INT32 | PhysicalType::INT64 => DType::Int,
        PhysicalType::INT96 => DType::DateTime,
        PhysicalType::FLOAT | PhysicalType::DOUBLE => DType::Float,
        PhysicalType::BYTE_ARRAY | PhysicalType::FIXED_LEN_BYTE_ARRAY => DType::Str,
    };
    (dtype, stamp)
}

fn from_epoch(value: i64, stamp: Stamp) -> Option<NaiveDateTime> {
    let per_second: i64 = match stamp {
        Stamp::Millis => 1_000,
        Stamp::Micros => 1_000_000,
        Stamp::Nanos => 1_000_000_000,
    };
    let secs = value.div_euclid(per_second);
    let nanos = (value.rem_euclid(per_second) * (1_000_000_000 / per_second)) as u32;
    chrono::DateTime::from_timestamp(secs, nanos).map(|dt| dt.naive_utc())
}

fn field_value(field: &Field, stamp: Option<Stamp>) -> Value {
    match field {
        Field::Null => Value::Null,
        Field::Bool(b) => Value::Bool(*b),
        Field::Byte(v) => Value::Int(*v as i64),
        Field::Short(v) => Value::Int(*v as i64),
        Field::Int(v) => Value::Int(*v as i64),
        Field::Long(v) => match stamp {
            Some(stamp) => from_epoch(*v, stamp).map(Value::DateTime).unwrap_or(Value::Null),
            None => Value::Int(*v),
        },
        Field::UByte(v) => Value::Int(*v as i64),
        Field::UShort(v) => Value::Int(*v as i64),
        Field::UInt(v) => Value::Int(*v as i64),
        Field::ULong(v) => Value::Int(*v as i64),
        Field::Float(v) => Value::Float(*v as f64),
        Field::Double(v) => Value::Float(*v),
        Field::Str(s) => Value::Str(s.clone()),
        Field::Bytes(b) => Value::Str(String::from_utf8_lossy(b.data()).into_owned()),
        Field::Date(days) => from_epoch(*days as i64 * 86_400_000, Stamp::Millis)
            .map(Value::DateTime)
            .unwrap_or(Value::Null),
        Field::TimestampMillis(v) => from_epoch(*v, Stamp::Millis)
            .map(Value::DateTime)
            .unwrap_or(Value::Null),
        Field::TimestampMicros(v) => from_epoch(*v, Stamp::Micros)
            .map(Value::DateTime)
            .unwrap_or(Value::Null),
        other => Value::Str(other.to_string()),
    }
}

/// Decode one parquet file. Index columns written by dataframe libraries
/// (`__index_level_N__`) are dropped.
pub fn decode(data: Bytes) -> Result<Frame> {
    let reader = SerializedFileReader::new(data)?;
    let schema = reader.metadata().file_metadata().schema_descr_ptr();
    if schema.root_schema().get_fields().iter().any(|f| f.is_group()) {
        return Err(Error::value("Nested parquet columns are not supported"));
    }
    let layout: Vec<(String, DType, Option<Stamp>)> = schema
        .columns()
        .iter()
        .map(|c| {
            let (dtype, stamp) = column_dtype(c);
            (c.name().to_string(), dtype, stamp)
        })
        .collect();

    let mut values: Vec<Vec<Value>> = vec![Vec::new(); layout.len()];
    for row in reader.get_row_iter(None)? {
        let row = row?;
        for (i, (_, field)) in row.get_column_iter().enumerate() {
            values[i].push(field_value(field, layout[i].2));
        }
    }

    let columns = layout
        .into_iter()
        .zip(values)
        .filter(|((name, _, _), _)| !name.starts_with("__index_level_"))
        .map(|((name, dtype, _), values)| Column::new(name, dtype, values))
        .collect();
    Frame::new(columns)
}

fn primitive(column: &Column) -> Result<Type> {
    let builder = match column.dtype {
        DType::Bool => Type::primitive_type_builder(&column.name, PhysicalType::BOOLEAN),
        DType::Int => Type::primitive_type_builder(&column.name, PhysicalType::INT64),
        DType::Float => Type::primitive_type_builder(&column.name, PhysicalType::DOUBLE),
        DType::Str => Type::primitive_type_builder(&column.name, PhysicalType::BYTE_ARRAY)
            .with_logical_type(Some(LogicalType::String)),
        DType::DateTime => Type::primitive_type_builder(&column.name, PhysicalType::INT64)
            .with_logical_type(Some(LogicalType::Timestamp {
                is_adjusted_to_u_t_c: false,
                unit: TimeUnit::MICROS(MicroSeconds {}),
            })),
    };
    Ok(builder.with_repetition(Repetition::OPTIONAL).build()?)
}

/// Present cells of `column` and the matching definition levels.
fn present<T>(column: &Column, convert: impl Fn(&Value) -> Option<T>) -> (Vec<T>, Vec<i16>) {
    let mut out = Vec::with_capacity(column.len());
    let mut levels = Vec::with_capacity(column.len());
    for v in &column.values {
        match convert(v) {
            Some(x) => {
                out.push(x);
                levels.push(1);
            }
            None => levels.push(0),
        }
    }
    (out, levels)
}

/// Encode `frame` as a single row group.
pub fn encode(frame: &Frame, compression: Compression) -> Result<Bytes> {
    let fields = frame
        .columns()
        .iter()
        .map(|c| primitive(c).map(Arc::new))
        .collect::<Result<Vec<_>>>()?;
    let schema = Arc::new(Type::group_type_builder("schema").with_fields(fields).build()?);
    let props = Arc::new(
        WriterProperties::builder()
            .set_compression(compression.codec())
            .build(),
    );

    let mut writer = SerializedFileWriter::new(Vec::new(), schema, props)?;
    let mut row_group = writer.next_row_group()?;
    for column in frame.columns() {
        let mut slot = row_group
            .next_column()?
            .ok_or_else(|| Error::value(format!("No parquet writer left for column '{}'", column.name)))?;
        match column.dtype {
            DType::Bool => {
                let (data, levels) = present(column, |v| match v {
                    Value::Bool(b) => Some(*b),
                    _ => None,
                });
                slot.typed::<BoolType>().write_batch(&data, Some(&levels[..]), None)?;
            }
            DType::Int => {
                let (data, levels) = present(column, |v| match v {
                    Value::Int(x) => Some(*x),
                    _ => None,
                });
                slot.typed::<Int64Type>().write_batch(&data, Some(&levels[..]), None)?;
            }
            DType::Float => {
                let (data, levels) = present(column, |v| match v {
                    Value::Float(x) if !x.is_nan() => Some(*x),
                    Value::Int(x) => Some(*x as f64),
                    _ => None,
                });
                slot.typed::<DoubleType>().write_batch(&data, Some(&levels[..]), None)?;
            }
            DType::Str => {
                let (data, levels) = present(column, |v| match v {
                    Value::Null => None,
                    other => Some(ByteArray::from(other.to_string().as_str())),
                });
                slot.typed::<ByteArrayType>().write_batch(&data, Some(&levels[..]), None)?;
            }
            DType::DateTime => {
                let (data, levels) = present(column, |v| match v {
                    Value::DateTime(dt) => Some(dt.and_utc().timestamp_micros()),
                    _ => None,
                });
                slot.typed::<Int64Type>().write_batch(&data, Some(&levels[..]), None)?;
            }
        }
        slot.close()?;
    }
    row_group.close()?;
    Ok(Bytes::from(writer.into_inner()?))
}

/// Whether a file under a dataset directory holds data (not metadata or a
/// hidden/log entry).
pub fn is_data_file(relative: &str) -> bool {
    relative
        .split('/')
        .all(|segment| !segment.starts_with('_') && !segment.starts_with('.'))
}

/// `col=value` directory segments of a relative path.
pub fn partition_values(relative: &str) -> Vec<(String, String)> {
    let mut segments: Vec<&str> = relative.split('/').collect();
    segments.pop();
    segments
        .into_iter()
        .filter_map(|s| s.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Read a single file or every data file under a directory/prefix, adding
/// Hive partition directories back as string columns.
pub fn read_dataset(location: &Location) -> Result<Frame> {
    let files = storage::list_files(location)?;
    let mut frames = Vec::new();
    for file in &files {
        let relative = file.relative_to(location).unwrap_or_default();
        if !relative.is_empty() && !is_data_file(&relative) {
            continue;
        }
        let mut frame = decode(storage::read_bytes(file)?)?;
        let nrows = frame.nrows();
        for (key, value) in partition_values(&relative) {
            if frame.column(&key).is_none() {
                frame.push_column(Column::new(key, DType::Str, vec![Value::Str(value); nrows]))?;
            }
        }
        frames.push(frame);
    }
    if frames.is_empty() {
        return Err(Error::value(format!("No parquet data found at {}", location)));
    }
    log::debug!("[Parquet] read {} file(s) from {}", frames.len(), location);
    Frame::concat(frames)
}

pub fn write_file(frame: &Frame, location: &Location, compression: Compression) -> Result<()> {
    storage::write_bytes(location, encode(frame, compression)?)?;
    log::debug!("[Parquet] wrote {} rows to {}", frame.nrows(), location);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::parse_datetime;

    fn sample() -> Frame {
        Frame::new(vec![
            Column::strings("MERCHANT_NAME", &[Some("Shop"), None]),
            Column::floats("AMOUNT", &[12.5, 3.0]),
            Column::new("SIDE", DType::Int, vec![Value::Int(1), Value::Null]),
            Column::new(
                "DATE_EMITTED",
                DType::DateTime,
                vec![
                    Value::DateTime(parse_datetime("2024-01-02 03:04:05").unwrap()),
                    Value::Null,
                ],
            ),
            Column::new("FLAG", DType::Bool, vec![Value::Bool(true), Value::Bool(false)]),
        ])
        .unwrap()
    }

    #[test]
    fn encodes_and_decodes_every_dtype_with_nulls() {
        for compression in [Compression::Uncompressed, Compression::Snappy, Compression::Gzip] {
            let data = encode(&sample(), compression).unwrap();
            assert_eq!(decode(data).unwrap(), sample());
        }
    }

    #[test]
    fn reads_partitioned_directories() {
        let dir = tempfile::tempdir().unwrap();
        let base = Location::Local(dir.path().to_path_buf());
        let part = Frame::new(vec![Column::floats("AMOUNT", &[1.0])]).unwrap();
        write_file(&part, &base.join("SIDE=0/part-0.parquet"), Compression::Snappy).unwrap();
        write_file(&part, &base.join("SIDE=1/part-0.parquet"), Compression::Snappy).unwrap();
        storage::write_bytes(&base.join("_SUCCESS"), Bytes::new()).unwrap();

        let frame = read_dataset(&base).unwrap();
        assert_eq!(frame.nrows(), 2);
        assert_eq!(
            frame.get("SIDE").unwrap().values,
            vec![Value::Str("0".into()), Value::Str("1".into())]
        );
    }

    #[test]
    fn empty_directories_are_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_dataset(&Location::Local(dir.path().to_path_buf())).is_err());
    }
}
