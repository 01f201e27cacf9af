use crate::calc::value_from_correct_answers;
use crate::domain::{AttendanceStatus, Participation, Standing};
use crate::ipc::handlers::activities::{load_activity, Activity};
use crate::ipc::handlers::setup::{grading_settings, GradingSettings};
use crate::ipc::helpers::{
    db_query, db_write, optional_text, parse_params, require_row, settings_failed, with_conn,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordGrade {
    student_id: String,
    activity_id: String,
    status: String,
    participation: String,
    value: Option<f64>,
    correct_answers: Option<i64>,
    question_count: Option<i64>,
    performance: i64,
    standing: Option<String>,
    notes: Option<String>,
    #[serde(default)]
    ungraded: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GradeKey {
    student_id: String,
    activity_id: String,
}

/// One gradebook cell edit.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetField {
    student_id: String,
    activity_id: String,
    field: String,
    #[serde(default)]
    value: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GradeField {
    Value,
    Performance,
    Status,
    Standing,
}

impl GradeField {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "value" | "nota" => Some(Self::Value),
            "performance" | "desempenho" => Some(Self::Performance),
            "status" => Some(Self::Status),
            "standing" | "situacao" | "situação" => Some(Self::Standing),
            _ => None,
        }
    }

    fn column(self) -> &'static str {
        match self {
            Self::Value => "value",
            Self::Performance => "performance",
            Self::Status => "status",
            Self::Standing => "standing",
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListForClass {
    class_id: String,
}

const SCORE_COLUMNS: &str = "s.id, s.activity_id, s.student_id, s.value, s.correct_answers, s.status, \
     s.participation, s.performance, s.standing, s.notes, s.updated_at";

fn score_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "activityId": r.get::<_, String>(1)?,
        "studentId": r.get::<_, String>(2)?,
        "value": r.get::<_, Option<f64>>(3)?,
        "correctAnswers": r.get::<_, Option<i64>>(4)?,
        "status": r.get::<_, String>(5)?,
        "participation": r.get::<_, String>(6)?,
        "performance": r.get::<_, Option<i64>>(7)?,
        "standing": r.get::<_, Option<String>>(8)?,
        "notes": r.get::<_, Option<String>>(9)?,
        "updatedAt": r.get::<_, Option<String>>(10)?,
    }))
}

fn load_score(
    conn: &Connection,
    student_id: &str,
    activity_id: &str,
) -> Result<Option<serde_json::Value>, HandlerErr> {
    let sql = format!(
        "SELECT {} FROM scores s WHERE s.student_id = ? AND s.activity_id = ?",
        SCORE_COLUMNS
    );
    conn.query_row(&sql, (student_id, activity_id), score_json)
        .optional()
        .map_err(db_query)
}

fn require_enrolled(conn: &Connection, student_id: &str, activity: &Activity) -> Result<(), HandlerErr> {
    let student_class: Option<Option<String>> = conn
        .query_row(
            "SELECT class_id FROM students WHERE id = ?",
            [student_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_query)?;
    let Some(student_class) = student_class else {
        return Err(HandlerErr::not_found("student"));
    };
    if student_class.as_deref() != Some(activity.class_id.as_str()) {
        return Err(
            HandlerErr::bad_params("student is not enrolled in the activity's class").with_details(
                json!({ "studentId": student_id, "classId": activity.class_id }),
            ),
        );
    }
    Ok(())
}

/// A value must fit the grading scale and, when the activity carries a
/// positive weight, must not exceed that weight.
fn check_value(value: f64, activity: &Activity, grading: &GradingSettings) -> Result<(), HandlerErr> {
    if !value.is_finite() || value < 0.0 || value > grading.max_score {
        return Err(HandlerErr::bad_params(format!(
            "value must be between 0 and {}",
            grading.max_score
        ))
        .with_details(json!({ "value": value })));
    }
    if let Some(weight) = activity.weight.filter(|w| *w > 0.0) {
        if value > weight {
            return Err(HandlerErr::bad_params(format!(
                "value exceeds the activity maximum of {}",
                weight
            ))
            .with_details(json!({ "value": value, "weight": weight })));
        }
    }
    Ok(())
}

fn grades_record(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let req: RecordGrade = parse_params(params)?;
    let Some(activity) = load_activity(conn, &req.activity_id)? else {
        return Err(HandlerErr::not_found("activity"));
    };
    require_enrolled(conn, &req.student_id, &activity)?;

    let status = AttendanceStatus::parse(&req.status).ok_or_else(|| {
        HandlerErr::bad_params("status must be one of: present, absent, excused")
            .with_details(json!({ "status": req.status }))
    })?;
    let participation = Participation::parse(&req.participation).ok_or_else(|| {
        HandlerErr::bad_params("participation must be one of: full, partial, none")
            .with_details(json!({ "participation": req.participation }))
    })?;
    if !(0..=100).contains(&req.performance) {
        return Err(HandlerErr::bad_params("performance must be between 0 and 100"));
    }
    let standing = match req.standing.as_deref() {
        Some(raw) => Standing::parse(raw).ok_or_else(|| {
            HandlerErr::bad_params("unknown standing").with_details(json!({ "standing": raw }))
        })?,
        None => Standing::from_performance(req.performance as f64),
    };
    if req.correct_answers.is_some_and(|n| n < 0) {
        return Err(HandlerErr::bad_params("correctAnswers must not be negative"));
    }

    let grading = grading_settings(conn).map_err(settings_failed)?;
    let question_count = req.question_count.or(activity.question_count);
    // Out-of-range answer counts fall back to the typed value.
    let derived = match (req.correct_answers, question_count) {
        (Some(correct), Some(questions)) => {
            value_from_correct_answers(correct, questions, activity.weight)
        }
        _ => None,
    };
    let value = if req.ungraded {
        None
    } else {
        Some(derived.or(req.value).unwrap_or(0.0))
    };
    if let Some(v) = value {
        check_value(v, &activity, &grading)?;
    }

    let updated_at = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO scores(id, activity_id, student_id, value, correct_answers, status, participation, performance, standing, notes, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(activity_id, student_id) DO UPDATE SET
           value = excluded.value,
           correct_answers = excluded.correct_answers,
           status = excluded.status,
           participation = excluded.participation,
           performance = excluded.performance,
           standing = excluded.standing,
           notes = excluded.notes,
           updated_at = excluded.updated_at",
        (
            Uuid::new_v4().to_string(),
            &req.activity_id,
            &req.student_id,
            value,
            req.correct_answers,
            status.as_str(),
            participation.as_str(),
            req.performance,
            standing.as_str(),
            optional_text(req.notes),
            &updated_at,
        ),
    )
    .map_err(db_write("db_insert_failed", "scores"))?;

    let score = load_score(conn, &req.student_id, &req.activity_id)?;
    Ok(json!({ "score": score }))
}

/// Numeric cell input: JSON numbers, or text with either decimal separator.
/// Null and blank text read as no input.
fn numeric_cell(raw: &serde_json::Value, field: &str) -> Result<Option<f64>, HandlerErr> {
    let invalid = || {
        HandlerErr::bad_params(format!("{} must be a number", field))
            .with_details(json!({ "value": raw }))
    };
    match raw {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::Number(n) => n.as_f64().map(Some).ok_or_else(invalid),
        serde_json::Value::String(s) if s.trim().is_empty() => Ok(None),
        serde_json::Value::String(s) => s
            .trim()
            .replace(',', ".")
            .parse::<f64>()
            .map(Some)
            .map_err(|_| invalid()),
        _ => Err(invalid()),
    }
}

fn text_cell(raw: &serde_json::Value) -> Option<&str> {
    raw.as_str().map(str::trim).filter(|s| !s.is_empty())
}

fn grades_set_field(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let req: SetField = parse_params(params)?;
    let field = GradeField::parse(&req.field).ok_or_else(|| {
        HandlerErr::bad_params("field must be one of: value, performance, status, standing")
            .with_details(json!({ "field": req.field }))
    })?;
    let Some(activity) = load_activity(conn, &req.activity_id)? else {
        return Err(HandlerErr::not_found("activity"));
    };
    require_enrolled(conn, &req.student_id, &activity)?;

    let cell = match field {
        GradeField::Value => {
            let value = numeric_cell(&req.value, "value")?.unwrap_or(0.0);
            let grading = grading_settings(conn).map_err(settings_failed)?;
            check_value(value, &activity, &grading)?;
            SqlValue::Real(value)
        }
        GradeField::Performance => {
            let performance = numeric_cell(&req.value, "performance")?.unwrap_or(0.0);
            if performance.fract() != 0.0 || !(0.0..=100.0).contains(&performance) {
                return Err(HandlerErr::bad_params("performance must be a whole number between 0 and 100")
                    .with_details(json!({ "value": req.value })));
            }
            SqlValue::Integer(performance as i64)
        }
        GradeField::Status => {
            let status = text_cell(&req.value)
                .and_then(AttendanceStatus::parse)
                .ok_or_else(|| {
                    HandlerErr::bad_params("status must be one of: present, absent, excused")
                        .with_details(json!({ "value": req.value }))
                })?;
            SqlValue::Text(status.as_str().to_string())
        }
        GradeField::Standing => match text_cell(&req.value) {
            None => SqlValue::Null,
            Some(raw) => {
                let standing = Standing::parse(raw).ok_or_else(|| {
                    HandlerErr::bad_params("unknown standing").with_details(json!({ "standing": raw }))
                })?;
                SqlValue::Text(standing.as_str().to_string())
            }
        },
    };

    let updated_at = chrono::Utc::now().to_rfc3339();
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    // A first edit starts from a present, fully participating, zero-point record.
    tx.execute(
        "INSERT INTO scores(id, activity_id, student_id, value, status, participation, performance, standing, updated_at)
         VALUES(?, ?, ?, 0.0, ?, ?, 0, ?, ?)
         ON CONFLICT(activity_id, student_id) DO NOTHING",
        (
            Uuid::new_v4().to_string(),
            &req.activity_id,
            &req.student_id,
            AttendanceStatus::Present.as_str(),
            Participation::Full.as_str(),
            Standing::Good.as_str(),
            &updated_at,
        ),
    )
    .map_err(db_write("db_insert_failed", "scores"))?;
    let sql = format!(
        "UPDATE scores SET {} = ?, updated_at = ? WHERE activity_id = ? AND student_id = ?",
        field.column()
    );
    tx.execute(&sql, (cell, &updated_at, &req.activity_id, &req.student_id))
        .map_err(db_write("db_update_failed", "scores"))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    let score = load_score(conn, &req.student_id, &req.activity_id)?;
    Ok(json!({ "score": score }))
}

fn grades_get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let req: GradeKey = parse_params(params)?;
    require_row(conn, "students", &req.student_id, "student")?;
    require_row(conn, "activities", &req.activity_id, "activity")?;
    let score = load_score(conn, &req.student_id, &req.activity_id)?;
    Ok(json!({ "score": score }))
}

fn grades_list_for_class(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let req: ListForClass = parse_params(params)?;
    require_row(conn, "classes", &req.class_id, "class")?;

    let sql = format!(
        "SELECT {}, st.name, a.title
         FROM scores s
         JOIN activities a ON a.id = s.activity_id
         JOIN students st ON st.id = s.student_id
         WHERE a.class_id = ?
         ORDER BY a.date DESC, a.title, st.name",
        SCORE_COLUMNS
    );
    let mut stmt = conn.prepare(&sql).map_err(db_query)?;
    let scores = stmt
        .query_map([&req.class_id], |r| {
            let mut v = score_json(r)?;
            v["studentName"] = json!(r.get::<_, String>(11)?);
            v["activityTitle"] = json!(r.get::<_, String>(12)?);
            Ok(v)
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    Ok(json!({ "scores": scores }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.record" => Some(with_conn(state, req, grades_record)),
        "grades.setField" => Some(with_conn(state, req, grades_set_field)),
        "grades.get" => Some(with_conn(state, req, grades_get)),
        "grades.listForClass" => Some(with_conn(state, req, grades_list_for_class)),
        _ => None,
    }
}
