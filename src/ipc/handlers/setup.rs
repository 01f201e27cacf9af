use crate::db;
use crate::domain::GradingPeriod;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::{json, Map, Value};

#[derive(Clone, Copy)]
enum SetupSection {
    Grading,
    Dashboard,
    School,
}

impl SetupSection {
    const ALL: [SetupSection; 3] = [Self::Grading, Self::Dashboard, Self::School];

    fn parse(s: &str) -> Option<Self> {
        match s {
            "grading" => Some(Self::Grading),
            "dashboard" => Some(Self::Dashboard),
            "school" => Some(Self::School),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Grading => "grading",
            Self::Dashboard => "dashboard",
            Self::School => "school",
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Grading => "setup.grading",
            Self::Dashboard => "setup.dashboard",
            Self::School => "setup.school",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Grading => json!({
            "maxScore": 10.0,
            "defaultPeriod": GradingPeriod::Third.label(),
            "defaultActivityWeight": 10.0
        }),
        SetupSection::Dashboard => json!({
            "topStudentsCount": 10
        }),
        SetupSection::School => json!({
            "displayName": "",
            "academicYear": null
        }),
    }
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

fn parse_f64_range(v: &Value, key: &str, min_exclusive: f64, max: f64) -> Result<f64, String> {
    let Some(n) = v.as_f64() else {
        return Err(format!("{} must be a number", key));
    };
    if !(n > min_exclusive && n <= max) {
        return Err(format!("{} must be > {} and <= {}", key, min_exclusive, max));
    }
    Ok(n)
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let Some(n) = v.as_i64() else {
        return Err(format!("{} must be an integer", key));
    };
    if n < min || n > max {
        return Err(format!("{} must be between {} and {}", key, min, max));
    }
    Ok(n)
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let Some(s) = v.as_str() else {
        return Err(format!("{} must be a string", key));
    };
    if s.chars().count() > max_len {
        return Err(format!("{} must be <= {} chars", key, max_len));
    }
    Ok(s.trim().to_string())
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::Grading => match k.as_str() {
                "maxScore" => {
                    obj.insert(k.clone(), json!(parse_f64_range(v, k, 0.0, 100.0)?));
                }
                "defaultActivityWeight" => {
                    obj.insert(k.clone(), json!(parse_f64_range(v, k, 0.0, 100.0)?));
                }
                "defaultPeriod" => {
                    let label = v.as_str().unwrap_or_default();
                    let Some(period) = GradingPeriod::parse(label) else {
                        return Err("defaultPeriod must be a known period label".to_string());
                    };
                    obj.insert(k.clone(), json!(period.label()));
                }
                _ => return Err(format!("unknown grading field: {}", k)),
            },
            SetupSection::Dashboard => match k.as_str() {
                "topStudentsCount" => {
                    obj.insert(k.clone(), json!(parse_i64_range(v, k, 1, 100)?));
                }
                _ => return Err(format!("unknown dashboard field: {}", k)),
            },
            SetupSection::School => match k.as_str() {
                "displayName" => {
                    obj.insert(k.clone(), json!(parse_string_max(v, k, 150)?));
                }
                "academicYear" => {
                    if v.is_null() {
                        obj.insert(k.clone(), Value::Null);
                    } else {
                        obj.insert(k.clone(), json!(parse_i64_range(v, k, 2000, 2100)?));
                    }
                }
                _ => return Err(format!("unknown school field: {}", k)),
            },
        }
    }
    Ok(())
}

fn load_section(conn: &Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Malformed historical values fall back to defaults field by field.
            if let Err(e) = merge_section_patch(section, &mut current, saved_obj) {
                log::warn!("ignoring saved {} settings: {}", section.name(), e);
                current = default_section(section);
            }
        }
    }
    Ok(current)
}

#[derive(Debug, Clone, PartialEq)]
pub struct GradingSettings {
    pub max_score: f64,
    pub default_period: GradingPeriod,
    pub default_activity_weight: f64,
}

pub fn grading_settings(conn: &Connection) -> anyhow::Result<GradingSettings> {
    let v = load_section(conn, SetupSection::Grading)?;
    Ok(GradingSettings {
        max_score: v.get("maxScore").and_then(|x| x.as_f64()).unwrap_or(10.0),
        default_period: v
            .get("defaultPeriod")
            .and_then(|x| x.as_str())
            .and_then(GradingPeriod::parse)
            .unwrap_or(GradingPeriod::Third),
        default_activity_weight: v
            .get("defaultActivityWeight")
            .and_then(|x| x.as_f64())
            .unwrap_or(10.0),
    })
}

pub fn top_students_count(conn: &Connection) -> anyhow::Result<usize> {
    let v = load_section(conn, SetupSection::Dashboard)?;
    let n = v
        .get("topStudentsCount")
        .and_then(|x| x.as_u64())
        .unwrap_or(10);
    Ok(usize::try_from(n).unwrap_or(10))
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let mut out = Map::new();
    for section in SetupSection::ALL {
        match load_section(conn, section) {
            Ok(v) => {
                out.insert(section.name().to_string(), v);
            }
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }
    ok(&req.id, Value::Object(out))
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_section(conn, section) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = merge_section_patch(section, &mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, section.key(), &current) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true, section.name(): current }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}
