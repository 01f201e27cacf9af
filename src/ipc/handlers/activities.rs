use crate::domain::{ActivityKind, GradingPeriod};
use crate::ipc::handlers::setup::{grading_settings, GradingSettings};
use crate::ipc::helpers::{
    db_query, db_write, double_option, optional_text, parse_iso_date, parse_params, require_row,
    required_text, settings_failed, today_iso, with_conn, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

const TITLE_MAX_LEN: usize = 100;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListActivities {
    class_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateActivity {
    class_id: String,
    title: String,
    kind: String,
    period: Option<String>,
    date: Option<String>,
    weight: Option<f64>,
    question_count: Option<i64>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateActivity {
    activity_id: String,
    title: Option<String>,
    kind: Option<String>,
    period: Option<String>,
    date: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    weight: Option<Option<f64>>,
    #[serde(default, deserialize_with = "double_option")]
    question_count: Option<Option<i64>>,
    #[serde(default, deserialize_with = "double_option")]
    description: Option<Option<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActivityRef {
    activity_id: String,
}

#[derive(Debug, Clone)]
pub struct Activity {
    pub id: String,
    pub class_id: String,
    pub title: String,
    pub kind: ActivityKind,
    pub weight: Option<f64>,
    pub period: GradingPeriod,
    pub date: Option<String>,
    pub description: Option<String>,
    pub question_count: Option<i64>,
}

impl Activity {
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "classId": self.class_id,
            "title": self.title,
            "kind": self.kind,
            "weight": self.weight,
            "period": self.period,
            "date": self.date,
            "description": self.description,
            "questionCount": self.question_count,
        })
    }
}

const ACTIVITY_COLUMNS: &str =
    "id, class_id, title, kind, weight, period, date, description, question_count";

fn read_activity(r: &rusqlite::Row<'_>) -> rusqlite::Result<Activity> {
    let kind_raw: String = r.get(3)?;
    let period_raw: Option<String> = r.get(5)?;
    Ok(Activity {
        id: r.get(0)?,
        class_id: r.get(1)?,
        title: r.get(2)?,
        kind: ActivityKind::parse(&kind_raw).unwrap_or(ActivityKind::Activity),
        weight: r.get(4)?,
        period: GradingPeriod::from_label_or_first(period_raw.as_deref()),
        date: r.get(6)?,
        description: r.get(7)?,
        question_count: r.get(8)?,
    })
}

pub fn load_activity(conn: &Connection, activity_id: &str) -> Result<Option<Activity>, HandlerErr> {
    let sql = format!("SELECT {} FROM activities WHERE id = ?", ACTIVITY_COLUMNS);
    conn.query_row(&sql, [activity_id], read_activity)
        .optional()
        .map_err(db_query)
}

fn parse_kind(raw: &str) -> Result<ActivityKind, HandlerErr> {
    ActivityKind::parse(raw).ok_or_else(|| {
        HandlerErr::bad_params("unknown activity kind").with_details(json!({ "kind": raw }))
    })
}

fn check_weight(weight: f64, grading: &GradingSettings) -> Result<(), HandlerErr> {
    if !weight.is_finite() || weight < 0.0 || weight > grading.max_score {
        return Err(HandlerErr::bad_params(format!(
            "weight must be between 0 and {}",
            grading.max_score
        ))
        .with_details(json!({ "weight": weight })));
    }
    Ok(())
}

fn check_question_count(kind: ActivityKind, question_count: Option<i64>) -> Result<(), HandlerErr> {
    match question_count {
        Some(n) if n < 1 => Err(HandlerErr::bad_params("questionCount must be at least 1")),
        None if kind == ActivityKind::Exam => {
            Err(HandlerErr::bad_params("exams require questionCount"))
        }
        _ => Ok(()),
    }
}

fn normalize_date(raw: &str) -> Result<String, HandlerErr> {
    Ok(parse_iso_date(raw, "date")?.format("%Y-%m-%d").to_string())
}

fn activities_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let req: ListActivities = parse_params(params)?;
    require_row(conn, "classes", &req.class_id, "class")?;

    let sql = format!(
        "SELECT {}, (SELECT COUNT(*) FROM scores s WHERE s.activity_id = activities.id)
         FROM activities
         WHERE class_id = ?
         ORDER BY date IS NULL, date DESC, title",
        ACTIVITY_COLUMNS
    );
    let mut stmt = conn.prepare(&sql).map_err(db_query)?;
    let activities = stmt
        .query_map([&req.class_id], |r| {
            let a = read_activity(r)?;
            let recorded: i64 = r.get(9)?;
            let mut v = a.to_json();
            v["recordCount"] = json!(recorded);
            Ok(v)
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    Ok(json!({ "activities": activities }))
}

fn activities_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let req: CreateActivity = parse_params(params)?;
    require_row(conn, "classes", &req.class_id, "class")?;
    let grading = grading_settings(conn).map_err(settings_failed)?;

    let kind = parse_kind(&req.kind)?;
    let weight = req.weight.unwrap_or(grading.default_activity_weight);
    check_weight(weight, &grading)?;
    check_question_count(kind, req.question_count)?;
    let period = match req.period.as_deref() {
        Some(label) => GradingPeriod::from_label_or_first(Some(label)),
        None => grading.default_period,
    };
    let date = match req.date.as_deref() {
        Some(raw) => normalize_date(raw)?,
        None => today_iso(),
    };

    let activity = Activity {
        id: Uuid::new_v4().to_string(),
        class_id: req.class_id,
        title: required_text(&req.title, "title", TITLE_MAX_LEN)?,
        kind,
        weight: Some(weight),
        period,
        date: Some(date),
        description: optional_text(req.description),
        question_count: req.question_count,
    };
    conn.execute(
        "INSERT INTO activities(id, class_id, title, kind, weight, period, date, description, question_count)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &activity.id,
            &activity.class_id,
            &activity.title,
            activity.kind.as_str(),
            activity.weight,
            activity.period.label(),
            &activity.date,
            &activity.description,
            activity.question_count,
        ),
    )
    .map_err(db_write("db_insert_failed", "activities"))?;
    Ok(json!({ "activityId": activity.id, "activity": activity.to_json() }))
}

fn activities_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let req: UpdateActivity = parse_params(params)?;
    let Some(mut activity) = load_activity(conn, &req.activity_id)? else {
        return Err(HandlerErr::not_found("activity"));
    };
    let grading = grading_settings(conn).map_err(settings_failed)?;

    if let Some(raw) = req.title {
        activity.title = required_text(&raw, "title", TITLE_MAX_LEN)?;
    }
    if let Some(raw) = req.kind {
        activity.kind = parse_kind(&raw)?;
    }
    if let Some(label) = req.period {
        activity.period = GradingPeriod::from_label_or_first(Some(&label));
    }
    if let Some(raw) = req.date {
        activity.date = Some(normalize_date(&raw)?);
    }
    if let Some(w) = req.weight {
        if let Some(v) = w {
            check_weight(v, &grading)?;
        }
        activity.weight = w;
    }
    if let Some(n) = req.question_count {
        activity.question_count = n;
    }
    if let Some(v) = req.description {
        activity.description = optional_text(v);
    }
    check_question_count(activity.kind, activity.question_count)?;

    conn.execute(
        "UPDATE activities
         SET title = ?, kind = ?, weight = ?, period = ?, date = ?, description = ?, question_count = ?
         WHERE id = ?",
        (
            &activity.title,
            activity.kind.as_str(),
            activity.weight,
            activity.period.label(),
            &activity.date,
            &activity.description,
            activity.question_count,
            &activity.id,
        ),
    )
    .map_err(db_write("db_update_failed", "activities"))?;
    Ok(json!({ "activity": activity.to_json() }))
}

fn activities_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let req: ActivityRef = parse_params(params)?;
    require_row(conn, "activities", &req.activity_id, "activity")?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let removed_scores = tx
        .execute("DELETE FROM scores WHERE activity_id = ?", [&req.activity_id])
        .map_err(db_write("db_delete_failed", "scores"))?;
    // Plans that generated this activity keep existing without the link.
    tx.execute(
        "UPDATE lesson_plans SET activity_id = NULL WHERE activity_id = ?",
        [&req.activity_id],
    )
    .map_err(db_write("db_update_failed", "lesson_plans"))?;
    tx.execute("DELETE FROM activities WHERE id = ?", [&req.activity_id])
        .map_err(db_write("db_delete_failed", "activities"))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "ok": true, "removedScores": removed_scores }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "activities.list" => Some(with_conn(state, req, activities_list)),
        "activities.create" => Some(with_conn(state, req, activities_create)),
        "activities.update" => Some(with_conn(state, req, activities_update)),
        "activities.delete" => Some(with_conn(state, req, activities_delete)),
        _ => None,
    }
}
