use crate::ipc::helpers::{
    db_query, db_write, optional_text, parse_params, required_text, with_conn, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSchool {
    name: String,
    address: Option<String>,
    phone: Option<String>,
    contact_email: Option<String>,
}

fn schools_list(conn: &Connection, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT
               sc.id, sc.name, sc.address, sc.phone, sc.contact_email,
               (SELECT COUNT(*) FROM users u WHERE u.school_id = sc.id) AS user_count
             FROM schools sc
             ORDER BY sc.name",
        )
        .map_err(db_query)?;
    let schools = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "address": r.get::<_, Option<String>>(2)?,
                "phone": r.get::<_, Option<String>>(3)?,
                "contactEmail": r.get::<_, Option<String>>(4)?,
                "userCount": r.get::<_, i64>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    Ok(json!({ "schools": schools }))
}

fn schools_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let req: CreateSchool = parse_params(params)?;
    let name = required_text(&req.name, "name", 150)?;
    let school_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO schools(id, name, address, phone, contact_email) VALUES(?, ?, ?, ?, ?)",
        (
            &school_id,
            &name,
            optional_text(req.address),
            optional_text(req.phone),
            optional_text(req.contact_email),
        ),
    )
    .map_err(db_write("db_insert_failed", "schools"))?;
    Ok(json!({ "schoolId": school_id, "name": name }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "schools.list" => Some(with_conn(state, req, schools_list)),
        "schools.create" => Some(with_conn(state, req, schools_create)),
        _ => None,
    }
}
