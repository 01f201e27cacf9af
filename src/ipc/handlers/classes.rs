use crate::domain::Role;
use crate::ipc::helpers::{
    db_query, db_write, double_option, optional_text, parse_params, require_row, required_text,
    with_conn, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListClasses {
    owner_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateClass {
    name: String,
    owner_id: String,
    description: Option<String>,
    shift: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateClass {
    class_id: String,
    name: Option<String>,
    owner_id: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    description: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    shift: Option<Option<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClassRef {
    class_id: String,
}

fn require_owner(conn: &Connection, owner_id: &str) -> Result<(), HandlerErr> {
    let role: Option<String> = conn
        .query_row("SELECT role FROM users WHERE id = ?", [owner_id], |r| r.get(0))
        .optional()
        .map_err(db_query)?;
    let Some(role) = role else {
        return Err(HandlerErr::not_found("owner").with_details(json!({ "ownerId": owner_id })));
    };
    if Role::parse(&role) == Some(Role::Student) {
        return Err(HandlerErr::bad_params("a student account cannot own a class"));
    }
    Ok(())
}

fn classes_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let req: ListClasses = parse_params(params)?;

    // Correlated subqueries avoid double-counting from joins.
    let mut stmt = conn
        .prepare(
            "SELECT
               c.id,
               c.name,
               c.description,
               c.shift,
               c.owner_id,
               (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id) AS student_count,
               (SELECT COUNT(*) FROM activities a WHERE a.class_id = c.id) AS activity_count
             FROM classes c
             WHERE (?1 IS NULL OR c.owner_id = ?1)
             ORDER BY c.name",
        )
        .map_err(db_query)?;
    let classes = stmt
        .query_map([&req.owner_id], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "name": row.get::<_, String>(1)?,
                "description": row.get::<_, Option<String>>(2)?,
                "shift": row.get::<_, Option<String>>(3)?,
                "ownerId": row.get::<_, String>(4)?,
                "studentCount": row.get::<_, i64>(5)?,
                "activityCount": row.get::<_, i64>(6)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    Ok(json!({ "classes": classes }))
}

fn classes_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let req: CreateClass = parse_params(params)?;
    let name = required_text(&req.name, "name", 100)?;
    require_owner(conn, &req.owner_id)?;

    let class_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO classes(id, name, description, shift, owner_id) VALUES(?, ?, ?, ?, ?)",
        (
            &class_id,
            &name,
            optional_text(req.description),
            optional_text(req.shift),
            &req.owner_id,
        ),
    )
    .map_err(db_write("db_insert_failed", "classes"))?;
    Ok(json!({ "classId": class_id, "name": name }))
}

fn classes_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let req: UpdateClass = parse_params(params)?;
    let current: Option<(String, Option<String>, Option<String>, String)> = conn
        .query_row(
            "SELECT name, description, shift, owner_id FROM classes WHERE id = ?",
            [&req.class_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
        .map_err(db_query)?;
    let Some((mut name, mut description, mut shift, mut owner_id)) = current else {
        return Err(HandlerErr::not_found("class"));
    };

    if let Some(raw) = req.name {
        name = required_text(&raw, "name", 100)?;
    }
    if let Some(raw) = req.owner_id {
        require_owner(conn, &raw)?;
        owner_id = raw;
    }
    if let Some(v) = req.description {
        description = optional_text(v);
    }
    if let Some(v) = req.shift {
        shift = optional_text(v);
    }

    conn.execute(
        "UPDATE classes SET name = ?, description = ?, shift = ?, owner_id = ? WHERE id = ?",
        (&name, &description, &shift, &owner_id, &req.class_id),
    )
    .map_err(db_write("db_update_failed", "classes"))?;
    Ok(json!({
        "classId": req.class_id,
        "name": name,
        "description": description,
        "shift": shift,
        "ownerId": owner_id
    }))
}

fn classes_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let req: ClassRef = parse_params(params)?;
    require_row(conn, "classes", &req.class_id, "class")?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    // Explicit dependency order; the schema declares no ON DELETE CASCADE.
    tx.execute(
        "DELETE FROM scores
         WHERE activity_id IN (SELECT id FROM activities WHERE class_id = ?)",
        [&req.class_id],
    )
    .map_err(db_write("db_delete_failed", "scores"))?;
    tx.execute(
        "DELETE FROM lesson_plans WHERE class_id = ?",
        [&req.class_id],
    )
    .map_err(db_write("db_delete_failed", "lesson_plans"))?;
    tx.execute("DELETE FROM activities WHERE class_id = ?", [&req.class_id])
        .map_err(db_write("db_delete_failed", "activities"))?;
    // Students outlive their class; they are only detached.
    let detached = tx
        .execute(
            "UPDATE students SET class_id = NULL WHERE class_id = ?",
            [&req.class_id],
        )
        .map_err(db_write("db_update_failed", "students"))?;
    tx.execute("DELETE FROM classes WHERE id = ?", [&req.class_id])
        .map_err(db_write("db_delete_failed", "classes"))?;

    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    log::info!(
        "class {} deleted; {} students detached",
        req.class_id,
        detached
    );
    Ok(json!({ "ok": true, "detachedStudents": detached }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.list" => Some(with_conn(state, req, classes_list)),
        "classes.create" => Some(with_conn(state, req, classes_create)),
        "classes.update" => Some(with_conn(state, req, classes_update)),
        "classes.delete" => Some(with_conn(state, req, classes_delete)),
        _ => None,
    }
}
