use crate::domain::{ActivityKind, PlanStatus};
use crate::ipc::handlers::setup::grading_settings;
use crate::ipc::helpers::{
    db_query, db_write, optional_text, parse_iso_date, parse_params, require_row, required_text,
    settings_failed, with_conn, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListPlans {
    class_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatePlan {
    class_id: String,
    planned_on: String,
    title: String,
    content: Option<String>,
    objectives: Option<String>,
    methodology: Option<String>,
    assessment: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetPlanStatus {
    plan_id: String,
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlanRef {
    plan_id: String,
}

const PLAN_COLUMNS: &str =
    "id, class_id, planned_on, title, content, objectives, methodology, assessment, status, activity_id";

fn plan_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "classId": r.get::<_, String>(1)?,
        "plannedOn": r.get::<_, String>(2)?,
        "title": r.get::<_, String>(3)?,
        "content": r.get::<_, Option<String>>(4)?,
        "objectives": r.get::<_, Option<String>>(5)?,
        "methodology": r.get::<_, Option<String>>(6)?,
        "assessment": r.get::<_, Option<String>>(7)?,
        "status": r.get::<_, String>(8)?,
        "activityId": r.get::<_, Option<String>>(9)?,
    }))
}

fn parse_status(raw: &str) -> Result<PlanStatus, HandlerErr> {
    PlanStatus::parse(raw).ok_or_else(|| {
        HandlerErr::bad_params("status must be one of: planned, taught, cancelled")
            .with_details(json!({ "status": raw }))
    })
}

fn plans_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let req: ListPlans = parse_params(params)?;
    require_row(conn, "classes", &req.class_id, "class")?;
    let sql = format!(
        "SELECT {} FROM lesson_plans WHERE class_id = ? ORDER BY planned_on DESC, title",
        PLAN_COLUMNS
    );
    let mut stmt = conn.prepare(&sql).map_err(db_query)?;
    let plans = stmt
        .query_map([&req.class_id], plan_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    Ok(json!({ "plans": plans }))
}

fn plans_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let req: CreatePlan = parse_params(params)?;
    require_row(conn, "classes", &req.class_id, "class")?;
    let planned_on = parse_iso_date(&req.planned_on, "plannedOn")?
        .format("%Y-%m-%d")
        .to_string();
    let title = required_text(&req.title, "title", 100)?;

    let plan_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO lesson_plans(id, class_id, planned_on, title, content, objectives, methodology, assessment, status)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &plan_id,
            &req.class_id,
            &planned_on,
            &title,
            optional_text(req.content),
            optional_text(req.objectives),
            optional_text(req.methodology),
            optional_text(req.assessment),
            PlanStatus::Planned.as_str(),
        ),
    )
    .map_err(db_write("db_insert_failed", "lesson_plans"))?;
    Ok(json!({ "planId": plan_id }))
}

fn plans_set_status(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let req: SetPlanStatus = parse_params(params)?;
    let status = parse_status(&req.status)?;
    let changed = conn
        .execute(
            "UPDATE lesson_plans SET status = ? WHERE id = ?",
            (status.as_str(), &req.plan_id),
        )
        .map_err(db_write("db_update_failed", "lesson_plans"))?;
    if changed == 0 {
        return Err(HandlerErr::not_found("plan"));
    }
    Ok(json!({ "planId": req.plan_id, "status": status }))
}

fn plans_launch(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let req: PlanRef = parse_params(params)?;
    type PlanFields = (String, String, String, Option<String>, Option<String>, Option<String>);
    let plan: Option<PlanFields> = conn
        .query_row(
            "SELECT class_id, planned_on, title, objectives, content, activity_id
             FROM lesson_plans WHERE id = ?",
            [&req.plan_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?)),
        )
        .optional()
        .map_err(db_query)?;
    let Some((class_id, planned_on, title, objectives, content, activity_id)) = plan else {
        return Err(HandlerErr::not_found("plan"));
    };
    if let Some(existing) = activity_id {
        return Err(HandlerErr::new("conflict", "plan was already launched")
            .with_details(json!({ "activityId": existing })));
    }

    let grading = grading_settings(conn).map_err(settings_failed)?;
    let description = format!(
        "Lesson plan: {}\nObjectives: {}\nContent: {}",
        title,
        objectives.as_deref().unwrap_or("-"),
        content.as_deref().unwrap_or("-")
    );
    let weight = grading.default_activity_weight.min(grading.max_score);
    let activity_id = Uuid::new_v4().to_string();

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        "INSERT INTO activities(id, class_id, title, kind, weight, period, date, description)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &activity_id,
            &class_id,
            &title,
            ActivityKind::Activity.as_str(),
            weight,
            grading.default_period.label(),
            &planned_on,
            &description,
        ),
    )
    .map_err(db_write("db_insert_failed", "activities"))?;
    tx.execute(
        "UPDATE lesson_plans SET status = ?, activity_id = ? WHERE id = ?",
        (PlanStatus::Taught.as_str(), &activity_id, &req.plan_id),
    )
    .map_err(db_write("db_update_failed", "lesson_plans"))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    log::info!("plan {} launched as activity {}", req.plan_id, activity_id);
    Ok(json!({ "planId": req.plan_id, "activityId": activity_id }))
}

fn plans_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let req: PlanRef = parse_params(params)?;
    let removed = conn
        .execute("DELETE FROM lesson_plans WHERE id = ?", [&req.plan_id])
        .map_err(db_write("db_delete_failed", "lesson_plans"))?;
    if removed == 0 {
        return Err(HandlerErr::not_found("plan"));
    }
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "plans.list" => Some(with_conn(state, req, plans_list)),
        "plans.create" => Some(with_conn(state, req, plans_create)),
        "plans.setStatus" => Some(with_conn(state, req, plans_set_status)),
        "plans.launch" => Some(with_conn(state, req, plans_launch)),
        "plans.delete" => Some(with_conn(state, req, plans_delete)),
        _ => None,
    }
}
