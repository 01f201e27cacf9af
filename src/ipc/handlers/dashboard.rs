use crate::calc::{self, AttendanceCounts, AttendancePolicy, PointsRow};
use crate::domain::{AttendanceStatus, GradingPeriod};
use crate::ipc::handlers::setup::top_students_count;
use crate::ipc::helpers::{
    db_query, like_pattern, parse_params, require_row, settings_failed, with_conn, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClassRef {
    class_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClassOverview {
    class_id: String,
    search: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GlobalDashboard {
    owner_id: String,
}

fn class_name(conn: &Connection, class_id: &str) -> Result<String, HandlerErr> {
    conn.query_row("SELECT name FROM classes WHERE id = ?", [class_id], |r| r.get(0))
        .map_err(db_query)
}

/// Status of every score recorded against the class's activities by students
/// still enrolled in the class.
fn class_statuses(conn: &Connection, class_id: &str) -> Result<AttendanceCounts, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT s.status
             FROM scores s
             JOIN activities a ON a.id = s.activity_id
             JOIN students st ON st.id = s.student_id
             WHERE a.class_id = ?1 AND st.class_id = ?1",
        )
        .map_err(db_query)?;
    let statuses = stmt
        .query_map([class_id], |r| r.get::<_, Option<String>>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    Ok(AttendanceCounts::tally(
        statuses
            .iter()
            .map(|s| s.as_deref().and_then(AttendanceStatus::parse)),
    ))
}

fn count(conn: &Connection, sql: &str, id: &str) -> Result<i64, HandlerErr> {
    conn.query_row(sql, [id], |r| r.get(0)).map_err(db_query)
}

fn dashboard_class(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let req: ClassRef = parse_params(params)?;
    require_row(conn, "classes", &req.class_id, "class")?;

    let rollup = calc::load_class_rollup(conn, &req.class_id)?;
    let total_activities = count(
        conn,
        "SELECT COUNT(*) FROM activities WHERE class_id = ?",
        &req.class_id,
    )?;
    let counts = class_statuses(conn, &req.class_id)?;

    Ok(json!({
        "classId": req.class_id,
        "className": class_name(conn, &req.class_id)?,
        "totalStudents": rollup.total_students,
        "totalActivities": total_activities,
        "classAverage": rollup.class_average,
        "buckets": rollup.buckets,
        "students": rollup.students,
        "statusCounts": counts,
        "frequency": counts.percentage(AttendancePolicy::Dashboard),
    }))
}

fn dashboard_class_overview(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let req: ClassOverview = parse_params(params)?;
    require_row(conn, "classes", &req.class_id, "class")?;

    let mut stmt = conn
        .prepare("SELECT id, weight, period FROM activities WHERE class_id = ?")
        .map_err(db_query)?;
    let activities: Vec<(String, Option<f64>, GradingPeriod)> = stmt
        .query_map([&req.class_id], |r| {
            let period: Option<String> = r.get(2)?;
            Ok((
                r.get(0)?,
                r.get(1)?,
                GradingPeriod::from_label_or_first(period.as_deref()),
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;

    let focused = calc::focused_period(activities.iter().map(|(_, _, p)| *p));
    let layout = calc::points_breakdown(activities.iter().map(|(_, weight, period)| PointsRow {
        period: *period,
        weight: *weight,
        value: None,
    }));
    let periods: Vec<serde_json::Value> = layout
        .periods
        .iter()
        .map(|p| {
            json!({
                "period": p.period,
                "activityCount": p.activity_count,
                "maxScore": p.maximum,
            })
        })
        .collect();

    let pattern = like_pattern(req.search.as_deref());
    let mut stmt = conn
        .prepare(
            "SELECT id, name FROM students
             WHERE class_id = ?1 AND (?2 IS NULL OR lower(name) LIKE ?2 ESCAPE '\\')
             ORDER BY name",
        )
        .map_err(db_query)?;
    let students: Vec<(String, String)> = stmt
        .query_map((&req.class_id, &pattern), |r| Ok((r.get(0)?, r.get(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;

    let focused_ids: Vec<&str> = activities
        .iter()
        .filter(|(_, _, p)| *p == focused)
        .map(|(id, _, _)| id.as_str())
        .collect();
    let mut stmt = conn
        .prepare(
            "SELECT s.student_id, s.activity_id, s.value
             FROM scores s
             JOIN activities a ON a.id = s.activity_id
             WHERE a.class_id = ? AND s.value IS NOT NULL",
        )
        .map_err(db_query)?;
    let values: Vec<(String, String, f64)> = stmt
        .query_map([&req.class_id], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    let mut obtained: HashMap<String, f64> = HashMap::new();
    for (student_id, activity_id, value) in values {
        if value.is_finite() && focused_ids.contains(&activity_id.as_str()) {
            *obtained.entry(student_id).or_insert(0.0) += value;
        }
    }

    let students: Vec<serde_json::Value> = students
        .into_iter()
        .map(|(id, name)| {
            let points = obtained.get(&id).copied().unwrap_or(0.0);
            json!({ "studentId": id, "name": name, "focusedPoints": points })
        })
        .collect();

    Ok(json!({
        "classId": req.class_id,
        "className": class_name(conn, &req.class_id)?,
        "focusedPeriod": focused,
        "focusedMaxScore": layout
            .periods
            .iter()
            .find(|p| p.period == focused)
            .map(|p| p.maximum)
            .unwrap_or(0.0),
        "periods": periods,
        "totalMaxScore": layout.maximum_total,
        "students": students,
    }))
}

fn dashboard_global(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let req: GlobalDashboard = parse_params(params)?;
    require_row(conn, "users", &req.owner_id, "owner")?;
    let top_n = top_students_count(conn).map_err(settings_failed)?;

    let mut stmt = conn
        .prepare("SELECT id, name FROM classes WHERE owner_id = ? ORDER BY name")
        .map_err(db_query)?;
    let classes: Vec<(String, String)> = stmt
        .query_map([&req.owner_id], |r| Ok((r.get(0)?, r.get(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;

    let mut total_students = 0_i64;
    let mut total_activities = 0_i64;
    let mut class_rows: Vec<serde_json::Value> = Vec::new();
    for (class_id, name) in &classes {
        let students = count(conn, "SELECT COUNT(*) FROM students WHERE class_id = ?", class_id)?;
        let activities = count(
            conn,
            "SELECT COUNT(*) FROM activities WHERE class_id = ?",
            class_id,
        )?;
        total_students += students;
        total_activities += activities;

        let mut stmt = conn
            .prepare(
                "SELECT s.performance
                 FROM scores s
                 JOIN activities a ON a.id = s.activity_id
                 JOIN students st ON st.id = s.student_id
                 WHERE a.class_id = ?1 AND st.class_id = ?1 AND s.performance IS NOT NULL",
            )
            .map_err(db_query)?;
        let performances: Vec<i64> = stmt
            .query_map([class_id], |r| r.get(0))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(db_query)?;
        let counts = class_statuses(conn, class_id)?;

        class_rows.push(json!({
            "classId": class_id,
            "name": name,
            "studentCount": students,
            "activityCount": activities,
            "averagePerformance": calc::simple_mean(performances.iter().map(|p| *p as f64)),
            "frequency": counts.percentage(AttendancePolicy::Dashboard),
        }));
    }

    let mut stmt = conn
        .prepare(
            "SELECT st.id, st.name, c.name, s.value, a.weight
             FROM scores s
             JOIN activities a ON a.id = s.activity_id
             JOIN classes c ON c.id = a.class_id
             JOIN students st ON st.id = s.student_id
             WHERE c.owner_id = ? AND s.value IS NOT NULL",
        )
        .map_err(db_query)?;
    let graded: Vec<(String, String, String, f64, Option<f64>)> = stmt
        .query_map([&req.owner_id], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;

    // student id -> (name, class name, obtained, maximum)
    let mut totals: HashMap<String, (String, String, f64, f64)> = HashMap::new();
    for (student_id, student_name, class_name, value, weight) in graded {
        let entry = totals
            .entry(student_id)
            .or_insert((student_name, class_name, 0.0, 0.0));
        if value.is_finite() {
            entry.2 += value;
        }
        entry.3 += weight.filter(|w| w.is_finite()).unwrap_or(0.0);
    }
    let mut ranked: Vec<(String, String, String, f64)> = totals
        .into_iter()
        .filter_map(|(id, (name, class_name, obtained, maximum))| {
            calc::score_percentage(obtained, maximum).map(|pct| (id, name, class_name, pct))
        })
        .collect();
    ranked.sort_by(|a, b| b.3.total_cmp(&a.3).then_with(|| a.1.cmp(&b.1)));
    ranked.truncate(top_n);
    let top_students: Vec<serde_json::Value> = ranked
        .into_iter()
        .map(|(id, name, class_name, pct)| {
            json!({
                "studentId": id,
                "name": name,
                "className": class_name,
                "percentage": calc::round_off_1_decimal(pct),
            })
        })
        .collect();

    Ok(json!({
        "ownerId": req.owner_id,
        "totalClasses": classes.len(),
        "totalStudents": total_students,
        "totalActivities": total_activities,
        "classes": class_rows,
        "topStudents": top_students,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "dashboard.class" => Some(with_conn(state, req, dashboard_class)),
        "dashboard.classOverview" => Some(with_conn(state, req, dashboard_class_overview)),
        "dashboard.global" => Some(with_conn(state, req, dashboard_global)),
        _ => None,
    }
}
