use crate::calc::{self, AttendancePolicy, PointsRow};
use crate::domain::GradingPeriod;
use crate::ipc::handlers::students::load_student;
use crate::ipc::helpers::{db_query, parse_params, with_conn, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StudentRef {
    student_id: String,
}

fn class_name(conn: &Connection, class_id: Option<&str>) -> Result<Option<String>, HandlerErr> {
    let Some(class_id) = class_id else {
        return Ok(None);
    };
    conn.query_row("SELECT name FROM classes WHERE id = ?", [class_id], |r| r.get(0))
        .optional()
        .map_err(db_query)
}

fn reports_report_card(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let req: StudentRef = parse_params(params)?;
    let Some(student) = load_student(conn, &req.student_id)? else {
        return Err(HandlerErr::not_found("student"));
    };
    let card = calc::load_report_card(conn, &student.id)?;
    let attendance = calc::load_attendance(conn, &student.id, AttendancePolicy::Portal)?;
    // JSON objects lose key order; `ordered` keeps academic order.
    let ordered: Vec<serde_json::Value> = card
        .periods
        .iter()
        .map(|(period, totals)| {
            json!({
                "period": period,
                "numerator": totals.numerator,
                "denominator": totals.denominator,
                "average": totals.average,
            })
        })
        .collect();
    Ok(json!({
        "student": student.to_json(),
        "className": class_name(conn, student.class_id.as_deref())?,
        "periods": card.periods,
        "ordered": ordered,
        "overall": card.overall,
        "attendance": attendance,
    }))
}

fn reports_attendance(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let req: StudentRef = parse_params(params)?;
    let summary = calc::load_attendance(conn, &req.student_id, AttendancePolicy::Portal)?;
    Ok(json!({
        "studentId": req.student_id,
        "percentage": summary.percentage,
        "counts": summary.counts,
    }))
}

fn reports_student_profile(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let req: StudentRef = parse_params(params)?;
    let Some(student) = load_student(conn, &req.student_id)? else {
        return Err(HandlerErr::not_found("student"));
    };

    let mut listed: Vec<(GradingPeriod, serde_json::Value)> = Vec::new();
    let mut rows: Vec<PointsRow> = Vec::new();
    if let Some(class_id) = student.class_id.as_deref() {
        let mut stmt = conn
            .prepare(
                "SELECT a.id, a.title, a.kind, a.date, a.weight, a.period,
                        s.value, s.status, s.participation, s.performance, s.standing
                 FROM activities a
                 LEFT JOIN scores s ON s.activity_id = a.id AND s.student_id = ?1
                 WHERE a.class_id = ?2
                 ORDER BY a.date, a.title",
            )
            .map_err(db_query)?;
        let fetched = stmt
            .query_map((&student.id, class_id), |r| {
                let weight: Option<f64> = r.get(4)?;
                let period_raw: Option<String> = r.get(5)?;
                let value: Option<f64> = r.get(6)?;
                let status: Option<String> = r.get(7)?;
                let period = GradingPeriod::from_label_or_first(period_raw.as_deref());
                let item = json!({
                    "activityId": r.get::<_, String>(0)?,
                    "title": r.get::<_, String>(1)?,
                    "kind": r.get::<_, String>(2)?,
                    "date": r.get::<_, Option<String>>(3)?,
                    "weight": weight,
                    "recorded": status.is_some(),
                    "value": value,
                    "status": status,
                    "participation": r.get::<_, Option<String>>(8)?,
                    "performance": r.get::<_, Option<i64>>(9)?,
                    "standing": r.get::<_, Option<String>>(10)?,
                });
                Ok((PointsRow { period, weight, value }, item))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(db_query)?;
        for (row, item) in fetched {
            listed.push((row.period, item));
            rows.push(row);
        }
    }

    let breakdown = calc::points_breakdown(rows);
    let periods: Vec<serde_json::Value> = breakdown
        .periods
        .iter()
        .map(|p| {
            let activities: Vec<&serde_json::Value> = listed
                .iter()
                .filter(|(period, _)| *period == p.period)
                .map(|(_, item)| item)
                .collect();
            json!({
                "period": p.period,
                "activityCount": p.activity_count,
                "obtained": p.obtained,
                "maximum": p.maximum,
                "hasData": p.has_data,
                "activities": activities,
            })
        })
        .collect();

    Ok(json!({
        "student": student.to_json(),
        "className": class_name(conn, student.class_id.as_deref())?,
        "periods": periods,
        "obtainedTotal": breakdown.obtained_total,
        "maximumTotal": breakdown.maximum_total,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.reportCard" => Some(with_conn(state, req, reports_report_card)),
        "reports.attendance" => Some(with_conn(state, req, reports_attendance)),
        "reports.studentProfile" => Some(with_conn(state, req, reports_student_profile)),
        _ => None,
    }
}
