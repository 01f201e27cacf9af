use crate::calc::{self, AttendancePolicy};
use crate::ipc::handlers::students::{load_student, Student};
use crate::ipc::helpers::{db_query, parse_params, with_conn, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde::Deserialize;
use serde_json::json;

/// Either the student id or the id of the user account linked to it.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PortalDashboard {
    student_id: Option<String>,
    user_id: Option<String>,
}

fn resolve_student(conn: &Connection, req: &PortalDashboard) -> Result<Student, HandlerErr> {
    let student_id = match (req.student_id.as_deref(), req.user_id.as_deref()) {
        (Some(id), _) => id.to_string(),
        (None, Some(user_id)) => {
            let linked: Option<String> = conn
                .query_row(
                    "SELECT id FROM students WHERE user_id = ?",
                    [user_id],
                    |r| r.get(0),
                )
                .optional()
                .map_err(db_query)?;
            linked.ok_or_else(|| {
                HandlerErr::not_found("linked student").with_details(json!({ "userId": user_id }))
            })?
        }
        (None, None) => return Err(HandlerErr::bad_params("missing studentId or userId")),
    };
    load_student(conn, &student_id)?.ok_or_else(|| HandlerErr::not_found("student"))
}

fn portal_dashboard(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let req: PortalDashboard = parse_params(params)?;
    let student = resolve_student(conn, &req)?;

    let class = match student.class_id.as_deref() {
        Some(class_id) => conn
            .query_row(
                "SELECT c.id, c.name, c.shift, u.username
                 FROM classes c
                 LEFT JOIN users u ON u.id = c.owner_id
                 WHERE c.id = ?",
                [class_id],
                |r| {
                    Ok(json!({
                        "id": r.get::<_, String>(0)?,
                        "name": r.get::<_, String>(1)?,
                        "shift": r.get::<_, Option<String>>(2)?,
                        "teacher": r.get::<_, Option<String>>(3)?,
                    }))
                },
            )
            .optional()
            .map_err(db_query)?,
        None => None,
    };

    let attendance = calc::load_attendance(conn, &student.id, AttendancePolicy::Portal)?;

    let mut stmt = conn
        .prepare(
            "SELECT a.id, a.title, a.kind, a.date, a.period, a.weight,
                    s.value, s.status, s.participation, s.standing
             FROM scores s
             JOIN activities a ON a.id = s.activity_id
             WHERE s.student_id = ?
             ORDER BY a.date DESC, a.title",
        )
        .map_err(db_query)?;
    let done: Vec<(serde_json::Value, Option<f64>)> = stmt
        .query_map([&student.id], |r| {
            let value: Option<f64> = r.get(6)?;
            let item = json!({
                "activityId": r.get::<_, String>(0)?,
                "title": r.get::<_, String>(1)?,
                "kind": r.get::<_, String>(2)?,
                "date": r.get::<_, Option<String>>(3)?,
                "period": r.get::<_, Option<String>>(4)?,
                "weight": r.get::<_, Option<f64>>(5)?,
                "value": value,
                "status": r.get::<_, String>(7)?,
                "participation": r.get::<_, String>(8)?,
                "standing": r.get::<_, Option<String>>(9)?,
            });
            Ok((item, value))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    let average = calc::simple_mean(done.iter().filter_map(|(_, v)| *v));
    let done: Vec<serde_json::Value> = done.into_iter().map(|(item, _)| item).collect();

    let upcoming: Vec<serde_json::Value> = match student.class_id.as_deref() {
        Some(class_id) => {
            let mut stmt = conn
                .prepare(
                    "SELECT a.id, a.title, a.kind, a.date, a.period, a.weight
                     FROM activities a
                     WHERE a.class_id = ?1
                       AND NOT EXISTS (
                         SELECT 1 FROM scores s WHERE s.activity_id = a.id AND s.student_id = ?2
                       )
                     ORDER BY a.date, a.title",
                )
                .map_err(db_query)?;
            let rows = stmt
                .query_map((class_id, &student.id), |r| {
                    Ok(json!({
                        "activityId": r.get::<_, String>(0)?,
                        "title": r.get::<_, String>(1)?,
                        "kind": r.get::<_, String>(2)?,
                        "date": r.get::<_, Option<String>>(3)?,
                        "period": r.get::<_, Option<String>>(4)?,
                        "weight": r.get::<_, Option<f64>>(5)?,
                    }))
                })
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
                .map_err(db_query)?;
            rows
        }
        None => Vec::new(),
    };

    Ok(json!({
        "student": student.to_json(),
        "class": class,
        "attendance": attendance,
        "average": average,
        "doneActivities": done,
        "upcomingActivities": upcoming,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "portal.dashboard" => Some(with_conn(state, req, portal_dashboard)),
        _ => None,
    }
}
