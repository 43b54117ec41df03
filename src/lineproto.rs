use crate::classify::ClassifiedRecord;
use chrono::{DateTime, Utc};
use std::fmt;

#[derive(Debug, PartialEq)]
pub enum EncodeError {
    EmptyFieldSet,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EncodeError::EmptyFieldSet => write!(f, "record produced no valid fields"),
        }
    }
}

impl std::error::Error for EncodeError {}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
    Boolean(bool),
    Text(String),
}

impl FieldValue {
    //non-finite floats and empty strings have no line protocol representation
    fn is_valid(&self) -> bool {
        match self {
            FieldValue::Float(v) => v.is_finite(),
            FieldValue::Text(v) => !v.is_empty(),
            _ => true,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FieldValue::Float(v) => write!(f, "{}", v),
            FieldValue::Integer(v) => write!(f, "{}i", v),
            FieldValue::Boolean(v) => write!(f, "{}", v),
            FieldValue::Text(v) => write!(f, "\"{}\"", escape_field_string(v)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub measurement: String,
    pub tags: Vec<(String, String)>,
    pub fields: Vec<(String, FieldValue)>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl Point {
    pub fn to_line(&self) -> String {
        let mut line = escape_measurement(&self.measurement);
        for (key, value) in &self.tags {
            line.push(',');
            line.push_str(&escape_tag(key));
            line.push('=');
            line.push_str(&escape_tag(value));
        }
        line.push(' ');
        let fields: Vec<String> = self
            .fields
            .iter()
            .map(|(key, value)| format!("{}={}", escape_tag(key), value))
            .collect();
        line.push_str(&fields.join(","));
        if let Some(timestamp) = &self.timestamp {
            line.push_str(&format!(" {}", timestamp.timestamp()));
        }
        line
    }
}

pub fn escape_measurement(input: &str) -> String {
    input
        .replace('\\', "\\\\")
        .replace(',', "\\,")
        .replace(' ', "\\ ")
}

//tag keys, tag values and field keys share the same escaping rules
pub fn escape_tag(input: &str) -> String {
    input
        .replace('\\', "\\\\")
        .replace(',', "\\,")
        .replace(' ', "\\ ")
        .replace('=', "\\=")
}

pub fn escape_field_string(input: &str) -> String {
    input
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

pub fn encode(record: &ClassifiedRecord) -> Result<Point, EncodeError> {
    let fields: Vec<(String, FieldValue)> = record
        .fields
        .iter()
        .filter(|(_, value)| value.is_valid())
        .cloned()
        .collect();
    if fields.is_empty() {
        return Err(EncodeError::EmptyFieldSet);
    }
    let tags = record
        .tags
        .iter()
        .filter(|(_, value)| !value.trim().is_empty())
        .cloned()
        .collect();
    Ok(Point {
        measurement: record.device_class.measurement().to_string(),
        tags,
        fields,
        timestamp: record.timestamp,
    })
}

pub fn to_payload(points: &[Point]) -> String {
    points
        .iter()
        .map(Point::to_line)
        .collect::<Vec<String>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::DeviceClass;
    use chrono::TimeZone;

    fn inverter_record() -> ClassifiedRecord {
        ClassifiedRecord {
            device_class: DeviceClass::Inverter,
            tags: vec![
                ("serial".to_string(), "E00122345".to_string()),
                ("state".to_string(), "working".to_string()),
            ],
            fields: vec![("p_3phsum_kw".to_string(), FieldValue::Float(1.234))],
            timestamp: None,
        }
    }

    #[test]
    fn tag_escaping_covers_space_comma_equals() {
        assert_eq!(escape_tag("a b,c=d"), "a\\ b\\,c\\=d");
        assert_eq!(escape_tag("back\\slash"), "back\\\\slash");
    }

    #[test]
    fn measurement_escaping_leaves_equals_alone() {
        assert_eq!(escape_measurement("my measurement,x=1"), "my\\ measurement\\,x=1");
    }

    #[test]
    fn string_fields_are_quoted_and_escaped() {
        let value = FieldValue::Text("say \"hi\"".to_string());
        assert_eq!(value.to_string(), "\"say \\\"hi\\\"\"");
    }

    #[test]
    fn integers_carry_the_i_suffix() {
        assert_eq!(FieldValue::Integer(50).to_string(), "50i");
        assert_eq!(FieldValue::Integer(-3).to_string(), "-3i");
        assert_eq!(FieldValue::Float(50.0).to_string(), "50");
        assert_eq!(FieldValue::Boolean(true).to_string(), "true");
    }

    #[test]
    fn spec_example_line_is_produced() {
        let point = encode(&inverter_record()).unwrap();
        assert_eq!(
            point.to_line(),
            "pvs_inverter,serial=E00122345,state=working p_3phsum_kw=1.234"
        );
    }

    #[test]
    fn encoding_is_deterministic() {
        let record = inverter_record();
        let first = encode(&record).unwrap().to_line();
        let second = encode(&record).unwrap().to_line();
        assert_eq!(first, second);
    }

    #[test]
    fn empty_field_set_is_rejected() {
        let mut record = inverter_record();
        record.fields = vec![("p_3phsum_kw".to_string(), FieldValue::Float(f64::NAN))];
        assert_eq!(encode(&record), Err(EncodeError::EmptyFieldSet));
    }

    #[test]
    fn point_without_tags_is_legal() {
        let mut record = inverter_record();
        record.tags.clear();
        assert_eq!(
            encode(&record).unwrap().to_line(),
            "pvs_inverter p_3phsum_kw=1.234"
        );
    }

    #[test]
    fn empty_tag_values_are_dropped_at_encode_time_too() {
        let mut record = inverter_record();
        record.tags.push(("model".to_string(), "".to_string()));
        let point = encode(&record).unwrap();
        assert!(point.tags.iter().all(|(key, _)| key != "model"));
    }

    #[test]
    fn timestamp_is_appended_as_epoch_seconds() {
        let mut record = inverter_record();
        record.timestamp = Utc.timestamp_opt(1_700_000_000, 0).single();
        assert_eq!(
            encode(&record).unwrap().to_line(),
            "pvs_inverter,serial=E00122345,state=working p_3phsum_kw=1.234 1700000000"
        );
    }

    #[test]
    fn payload_joins_lines_in_stable_order() {
        let a = encode(&inverter_record()).unwrap();
        let mut record = inverter_record();
        record.tags[0].1 = "E00199999".to_string();
        let b = encode(&record).unwrap();
        let payload = to_payload(&[a, b]);
        assert_eq!(
            payload,
            "pvs_inverter,serial=E00122345,state=working p_3phsum_kw=1.234\n\
             pvs_inverter,serial=E00199999,state=working p_3phsum_kw=1.234"
        );
    }
}
