use crate::lineproto::FieldValue;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use std::fmt;

//discriminator keys, current firmware spelling first, then the legacy one
pub const TYPE_KEYS: [&str; 2] = ["type", "DEVICE_TYPE"];

#[derive(Debug, PartialEq)]
pub enum ClassifyError {
    UnknownType(String),
}

impl fmt::Display for ClassifyError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ClassifyError::UnknownType(discriminator) => {
                write!(f, "unknown device type: {:?}", discriminator)
            }
        }
    }
}

impl std::error::Error for ClassifyError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    Supervisor,
    Inverter,
    PowerMeter,
    EnergyStorage,
    CommInterface,
    CommSystem,
    DeviceState,
    SessionStart,
    GridProfile,
}

impl DeviceClass {
    pub fn measurement(&self) -> &'static str {
        match self {
            DeviceClass::Supervisor => "pvs_supervisor",
            DeviceClass::Inverter => "pvs_inverter",
            DeviceClass::PowerMeter => "pvs_power_meter",
            DeviceClass::EnergyStorage => "pvs_energy_storage",
            DeviceClass::CommInterface => "pvs_comm_interface",
            DeviceClass::CommSystem => "pvs_comm_system",
            DeviceClass::DeviceState => "pvs_device_state",
            DeviceClass::SessionStart => "pvs_session_start",
            DeviceClass::GridProfile => "pvs_grid_profile",
        }
    }

    pub fn from_discriminator(input: &str) -> Option<DeviceClass> {
        match input.trim().to_lowercase().as_str() {
            "pvs" | "supervisor" => Some(DeviceClass::Supervisor),
            "inverter" => Some(DeviceClass::Inverter),
            "power meter" | "power_meter" => Some(DeviceClass::PowerMeter),
            "energy storage" | "energy storage system" | "ess" => Some(DeviceClass::EnergyStorage),
            "comm interface" | "comm_interface" => Some(DeviceClass::CommInterface),
            "comm system" | "comm_system" => Some(DeviceClass::CommSystem),
            "device state" | "device_state" => Some(DeviceClass::DeviceState),
            "session start" | "session_start" => Some(DeviceClass::SessionStart),
            "grid profile" | "grid_profile" => Some(DeviceClass::GridProfile),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Tag,
    Float,
    Integer,
}

#[rustfmt::skip]
pub fn routing_table(class: DeviceClass) -> &'static [(&'static str, Route)] {
    match class {
        DeviceClass::Supervisor => &[
            ("device_type",         Route::Tag),
            ("model",               Route::Tag),
            ("serial",              Route::Tag),
            ("state",               Route::Tag),
            ("dl_comm_err",         Route::Integer),
            ("dl_cpu_load",         Route::Float),
            ("dl_err_count",        Route::Integer),
            ("dl_flash_avail",      Route::Integer),
            ("dl_mem_used",         Route::Integer),
            ("dl_scan_time",        Route::Integer),
            ("dl_skipped_scans",    Route::Integer),
            ("dl_untransmitted",    Route::Integer),
            ("dl_uptime",           Route::Integer),
        ],
        DeviceClass::Inverter => &[
            ("device_type",         Route::Tag),
            ("model",               Route::Tag),
            ("serial",              Route::Tag),
            ("state",               Route::Tag),
            ("freq_hz",             Route::Float),
            ("i_3phsum_a",          Route::Float),
            ("i_mppt1_a",           Route::Float),
            ("ltea_3phsum_kwh",     Route::Float),
            ("p_3phsum_kw",         Route::Float),
            ("p_mppt1_kw",          Route::Float),
            ("t_htsnk_degc",        Route::Float),
            ("v_mppt1_v",           Route::Float),
            ("vln_3phavg_v",        Route::Float),
        ],
        DeviceClass::PowerMeter => &[
            ("device_type",         Route::Tag),
            ("model",               Route::Tag),
            ("serial",              Route::Tag),
            ("mode",                Route::Tag),
            ("state",               Route::Tag),
            ("ct_scl_fctr",         Route::Integer),
            ("freq_hz",             Route::Float),
            ("i1_a",                Route::Float),
            ("i2_a",                Route::Float),
            ("neg_ltea_3phsum_kwh", Route::Float),
            ("net_ltea_3phsum_kwh", Route::Float),
            ("p_3phsum_kw",         Route::Float),
            ("pos_ltea_3phsum_kwh", Route::Float),
            ("q_3phsum_kvar",       Route::Float),
            ("s_3phsum_kva",        Route::Float),
            ("tot_pf_rto",          Route::Float),
            ("v12_v",               Route::Float),
            ("v1n_v",               Route::Float),
            ("v2n_v",               Route::Float),
        ],
        DeviceClass::EnergyStorage => &[
            ("device_type",         Route::Tag),
            ("model",               Route::Tag),
            ("serial",              Route::Tag),
            ("state",               Route::Tag),
            ("soc_val",             Route::Float),
            ("v_batt_v",            Route::Float),
            ("i_batt_a",            Route::Float),
            ("p_batt_kw",           Route::Float),
            ("t_invtr_degc",        Route::Float),
            ("ltea_3phsum_kwh",     Route::Float),
        ],
        DeviceClass::CommInterface => &[
            ("interface",           Route::Tag),
            ("link",                Route::Tag),
            ("mode",                Route::Tag),
            ("ssid",                Route::Tag),
            ("internet",            Route::Integer),
            ("sms",                 Route::Integer),
        ],
        DeviceClass::CommSystem => &[
            ("interface",           Route::Tag),
            ("interface_name",      Route::Tag),
            ("internet",            Route::Integer),
            ("sms",                 Route::Integer),
        ],
        DeviceClass::DeviceState => &[
            ("device_type",         Route::Tag),
            ("model",               Route::Tag),
            ("serial",              Route::Tag),
            ("state",               Route::Integer),
        ],
        DeviceClass::SessionStart => &[
            ("model",               Route::Tag),
            ("serial",              Route::Tag),
            ("fwver",               Route::Tag),
            ("swver",               Route::Tag),
            ("build",               Route::Integer),
            ("easicver",            Route::Float),
            ("ok",                  Route::Integer),
            ("scbuild",             Route::Integer),
            ("scver",               Route::Float),
            ("wnmodel",             Route::Integer),
            ("wnserial",            Route::Integer),
            ("wnver",               Route::Float),
        ],
        DeviceClass::GridProfile => &[
            ("active_id",           Route::Tag),
            ("active_name",         Route::Tag),
            ("pending_id",          Route::Tag),
            ("pending_name",        Route::Tag),
            ("status",              Route::Tag),
            ("supported_by",        Route::Tag),
            ("percent",             Route::Integer),
        ],
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedRecord {
    pub device_class: DeviceClass,
    pub tags: Vec<(String, String)>,
    pub fields: Vec<(String, FieldValue)>,
    pub timestamp: Option<DateTime<Utc>>,
}

pub fn classify(raw: &Value) -> Result<ClassifiedRecord, ClassifyError> {
    let map = raw
        .as_object()
        .ok_or_else(|| ClassifyError::UnknownType("non-object record".to_string()))?;
    let discriminator = TYPE_KEYS.iter().find_map(|key| {
        map.get(*key)
            .and_then(Value::as_str)
            .filter(|v| !v.is_empty())
    });
    let device_class = discriminator
        .and_then(DeviceClass::from_discriminator)
        .ok_or_else(|| {
            ClassifyError::UnknownType(discriminator.unwrap_or("missing").to_string())
        })?;

    let mut tags = Vec::new();
    let mut fields = Vec::new();
    for (name, route) in routing_table(device_class) {
        let value = match map.get(*name) {
            Some(v) => v,
            None => continue,
        };
        //empty values never make it into tags or fields
        if let Value::String(s) = value {
            if s.trim().is_empty() {
                continue;
            }
        }
        match route {
            Route::Tag => {
                if let Some(v) = tag_value(value) {
                    tags.push((name.to_string(), v));
                }
            }
            _ => match coerce(value, *route) {
                Some(v) => fields.push((name.to_string(), v)),
                None => debug!(
                    "{}: cannot coerce field {}={}, dropping it",
                    device_class.measurement(),
                    name,
                    value
                ),
            },
        }
    }

    if device_class == DeviceClass::PowerMeter && !tags.iter().any(|(key, _)| key == "mode") {
        if let Some(mode) = meter_mode(map) {
            tags.push(("mode".to_string(), mode.to_string()));
        }
    }

    Ok(ClassifiedRecord {
        device_class,
        tags,
        fields,
        timestamp: record_timestamp(map),
    })
}

fn tag_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn coerce(value: &Value, route: Route) -> Option<FieldValue> {
    match route {
        Route::Float => match value {
            Value::Number(n) => n.as_f64().filter(|v| v.is_finite()).map(FieldValue::Float),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .map(FieldValue::Float),
            _ => None,
        },
        Route::Integer => match value {
            Value::Number(n) => n.as_i64().map(FieldValue::Integer),
            Value::String(s) => s.trim().parse::<i64>().ok().map(FieldValue::Integer),
            Value::Bool(b) => Some(FieldValue::Integer(*b as i64)),
            _ => None,
        },
        Route::Tag => None,
    }
}

//production and consumption meters are told apart by the model name suffix
fn meter_mode(map: &Map<String, Value>) -> Option<&'static str> {
    let model = map.get("model").and_then(Value::as_str)?;
    match model.chars().last()?.to_ascii_lowercase() {
        'p' => Some("production"),
        'c' => Some("consumption"),
        _ => None,
    }
}

fn record_timestamp(map: &Map<String, Value>) -> Option<DateTime<Utc>> {
    let secs = match map.get("data_time")? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }?;
    Utc.timestamp_opt(secs, 0).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn inverter_record_is_classified() {
        let raw = json!({
            "type": "inverter",
            "serial": "E00122345",
            "p_3phsum_kw": "1.234",
            "state": "working"
        });
        let record = classify(&raw).unwrap();
        assert_eq!(record.device_class, DeviceClass::Inverter);
        assert_eq!(
            record.tags,
            vec![
                ("serial".to_string(), "E00122345".to_string()),
                ("state".to_string(), "working".to_string()),
            ]
        );
        assert_eq!(
            record.fields,
            vec![("p_3phsum_kw".to_string(), FieldValue::Float(1.234))]
        );
        assert_eq!(record.timestamp, None);
    }

    #[test]
    fn legacy_discriminator_key_is_accepted() {
        let raw = json!({"DEVICE_TYPE": "Power Meter", "serial": "M1", "freq_hz": "60.01"});
        let record = classify(&raw).unwrap();
        assert_eq!(record.device_class, DeviceClass::PowerMeter);
    }

    #[test]
    fn unknown_discriminator_is_rejected() {
        let raw = json!({"type": "flux capacitor", "serial": "X1"});
        assert_eq!(
            classify(&raw),
            Err(ClassifyError::UnknownType("flux capacitor".to_string()))
        );
    }

    #[test]
    fn missing_discriminator_is_rejected() {
        assert!(classify(&json!({"serial": "X1"})).is_err());
        assert!(classify(&json!("not an object")).is_err());
    }

    #[test]
    fn empty_tag_candidates_are_ignored() {
        let raw = json!({
            "type": "inverter",
            "serial": "E00122345",
            "state": "",
            "model": "   ",
            "p_3phsum_kw": "0.5"
        });
        let record = classify(&raw).unwrap();
        assert!(record.tags.iter().all(|(key, _)| key != "state" && key != "model"));
    }

    #[test]
    fn coercion_failure_drops_only_that_field() {
        let raw = json!({
            "type": "inverter",
            "serial": "E00122345",
            "freq_hz": "not-a-number",
            "t_htsnk_degc": "nan",
            "p_3phsum_kw": "1.0"
        });
        let record = classify(&raw).unwrap();
        assert_eq!(
            record.fields,
            vec![("p_3phsum_kw".to_string(), FieldValue::Float(1.0))]
        );
    }

    #[test]
    fn numeric_types_follow_the_class_table() {
        let raw = json!({
            "type": "power meter",
            "serial": "PVS6M23131084p",
            "ct_scl_fctr": "50",
            "p_3phsum_kw": "0.013776"
        });
        let record = classify(&raw).unwrap();
        assert!(record
            .fields
            .contains(&("ct_scl_fctr".to_string(), FieldValue::Integer(50))));
        assert!(record
            .fields
            .contains(&("p_3phsum_kw".to_string(), FieldValue::Float(0.013776))));
    }

    #[test]
    fn meter_mode_is_derived_from_model_suffix() {
        let raw = json!({
            "type": "power meter",
            "serial": "M1",
            "model": "PVS6M0400p",
            "freq_hz": "60.0"
        });
        let record = classify(&raw).unwrap();
        assert!(record
            .tags
            .contains(&("mode".to_string(), "production".to_string())));

        let raw = json!({
            "type": "power meter",
            "serial": "M2",
            "model": "PVS6M0400c",
            "mode": "consumption",
            "freq_hz": "60.0"
        });
        let record = classify(&raw).unwrap();
        //an explicit mode wins over derivation, and only appears once
        assert_eq!(
            record.tags.iter().filter(|(key, _)| key == "mode").count(),
            1
        );
    }

    #[test]
    fn comm_interface_flags_become_integers() {
        let raw = json!({
            "type": "comm interface",
            "interface": "sta0",
            "link": "connected",
            "ssid": "SunPower13084",
            "internet": true,
            "sms": "0"
        });
        let record = classify(&raw).unwrap();
        assert_eq!(
            record.fields,
            vec![
                ("internet".to_string(), FieldValue::Integer(1)),
                ("sms".to_string(), FieldValue::Integer(0)),
            ]
        );
    }

    #[test]
    fn data_time_becomes_the_record_timestamp() {
        let raw = json!({
            "type": "inverter",
            "serial": "E00122345",
            "p_3phsum_kw": "1.0",
            "data_time": "1700000000"
        });
        let record = classify(&raw).unwrap();
        assert_eq!(record.timestamp.map(|t| t.timestamp()), Some(1_700_000_000));
    }

    #[test]
    fn every_class_has_a_routing_table_with_fields() {
        let classes = [
            DeviceClass::Supervisor,
            DeviceClass::Inverter,
            DeviceClass::PowerMeter,
            DeviceClass::EnergyStorage,
            DeviceClass::CommInterface,
            DeviceClass::CommSystem,
            DeviceClass::DeviceState,
            DeviceClass::SessionStart,
            DeviceClass::GridProfile,
        ];
        for class in &classes {
            let table = routing_table(*class);
            assert!(
                table.iter().any(|(_, route)| *route != Route::Tag),
                "{} has no field routes",
                class.measurement()
            );
        }
    }
}
