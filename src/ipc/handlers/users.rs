use crate::domain::Role;
use crate::ipc::helpers::{
    db_query, db_write, double_option, optional_text, parse_params, require_row, required_text,
    with_conn, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListUsers {
    role: Option<String>,
    school_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateUser {
    username: String,
    role: String,
    school_id: Option<String>,
    contact_email: Option<String>,
    phone: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateUser {
    user_id: String,
    username: Option<String>,
    role: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    school_id: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    contact_email: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    phone: Option<Option<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserRef {
    user_id: String,
}

/// A user account as stored.
#[derive(Debug, Clone)]
struct UserRow {
    id: String,
    username: String,
    role: Role,
    school_id: Option<String>,
    contact_email: Option<String>,
    phone: Option<String>,
}

impl UserRow {
    fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "username": self.username,
            "role": self.role,
            "schoolId": self.school_id,
            "contactEmail": self.contact_email,
            "phone": self.phone,
        })
    }
}

fn parse_role(raw: &str) -> Result<Role, HandlerErr> {
    Role::parse(raw).ok_or_else(|| {
        HandlerErr::bad_params("role must be one of: admin, coordinator, teacher, student")
            .with_details(json!({ "role": raw }))
    })
}

type RawUser = (String, String, String, Option<String>, Option<String>, Option<String>);

fn read_user(r: &rusqlite::Row<'_>) -> rusqlite::Result<RawUser> {
    Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?))
}

fn into_user_row(raw: RawUser) -> Option<UserRow> {
    let (id, username, role_raw, school_id, contact_email, phone) = raw;
    let Some(role) = Role::parse(&role_raw) else {
        log::warn!("user {} has unknown role {:?}; skipped", id, role_raw);
        return None;
    };
    Some(UserRow {
        id,
        username,
        role,
        school_id,
        contact_email,
        phone,
    })
}

fn load_user(conn: &Connection, user_id: &str) -> Result<Option<UserRow>, HandlerErr> {
    let raw = conn
        .query_row(
            "SELECT id, username, role, school_id, contact_email, phone FROM users WHERE id = ?",
            [user_id],
            read_user,
        )
        .optional()
        .map_err(db_query)?;
    Ok(raw.and_then(into_user_row))
}

fn username_taken(conn: &Connection, username: &str, except_id: Option<&str>) -> Result<bool, HandlerErr> {
    let found: Option<String> = conn
        .query_row(
            "SELECT id FROM users WHERE username = ?",
            [username],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_query)?;
    Ok(match (found, except_id) {
        (Some(id), Some(except)) => id != except,
        (Some(_), None) => true,
        (None, _) => false,
    })
}

fn users_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let req: ListUsers = parse_params(params)?;

    let mut sql = String::from(
        "SELECT id, username, role, school_id, contact_email, phone FROM users WHERE 1 = 1",
    );
    let mut binds: Vec<Value> = Vec::new();
    if let Some(role_raw) = req.role.as_deref() {
        let role = parse_role(role_raw)?;
        sql.push_str(" AND role = ?");
        binds.push(Value::Text(role.as_str().to_string()));
    }
    if let Some(school_id) = req.school_id {
        sql.push_str(" AND school_id = ?");
        binds.push(Value::Text(school_id));
    }
    sql.push_str(" ORDER BY username");

    let mut stmt = conn.prepare(&sql).map_err(db_query)?;
    let rows = stmt
        .query_map(params_from_iter(binds), read_user)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    let users: Vec<serde_json::Value> = rows
        .into_iter()
        .filter_map(into_user_row)
        .map(|u| u.to_json())
        .collect();
    Ok(json!({ "users": users }))
}

fn users_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let req: CreateUser = parse_params(params)?;
    let username = required_text(&req.username, "username", 80)?;
    let role = parse_role(&req.role)?;
    let school_id = optional_text(req.school_id);
    if let Some(sid) = school_id.as_deref() {
        require_row(conn, "schools", sid, "school")?;
    }
    if username_taken(conn, &username, None)? {
        return Err(HandlerErr::new("conflict", "username already exists")
            .with_details(json!({ "username": username })));
    }

    let user = UserRow {
        id: Uuid::new_v4().to_string(),
        username,
        role,
        school_id,
        contact_email: optional_text(req.contact_email),
        phone: optional_text(req.phone),
    };
    conn.execute(
        "INSERT INTO users(id, username, role, school_id, contact_email, phone)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &user.id,
            &user.username,
            user.role.as_str(),
            &user.school_id,
            &user.contact_email,
            &user.phone,
        ),
    )
    .map_err(db_write("db_insert_failed", "users"))?;
    Ok(json!({ "userId": user.id, "user": user.to_json() }))
}

fn users_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let req: UpdateUser = parse_params(params)?;
    let Some(mut user) = load_user(conn, &req.user_id)? else {
        return Err(HandlerErr::not_found("user"));
    };

    if let Some(raw) = req.username {
        let username = required_text(&raw, "username", 80)?;
        if username_taken(conn, &username, Some(&user.id))? {
            return Err(HandlerErr::new("conflict", "username already exists")
                .with_details(json!({ "username": username })));
        }
        user.username = username;
    }
    if let Some(raw) = req.role {
        user.role = parse_role(&raw)?;
    }
    if let Some(school_id) = req.school_id {
        let school_id = optional_text(school_id);
        if let Some(sid) = school_id.as_deref() {
            require_row(conn, "schools", sid, "school")?;
        }
        user.school_id = school_id;
    }
    if let Some(v) = req.contact_email {
        user.contact_email = optional_text(v);
    }
    if let Some(v) = req.phone {
        user.phone = optional_text(v);
    }

    conn.execute(
        "UPDATE users
         SET username = ?, role = ?, school_id = ?, contact_email = ?, phone = ?
         WHERE id = ?",
        (
            &user.username,
            user.role.as_str(),
            &user.school_id,
            &user.contact_email,
            &user.phone,
            &user.id,
        ),
    )
    .map_err(db_write("db_update_failed", "users"))?;
    Ok(json!({ "user": user.to_json() }))
}

fn users_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let req: UserRef = parse_params(params)?;
    require_row(conn, "users", &req.user_id, "user")?;

    let owned_classes: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM classes WHERE owner_id = ?",
            [&req.user_id],
            |r| r.get(0),
        )
        .map_err(db_query)?;
    if owned_classes > 0 {
        return Err(
            HandlerErr::new("conflict", "user still owns classes; reassign or delete them first")
                .with_details(json!({ "classCount": owned_classes })),
        );
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        "UPDATE students SET user_id = NULL WHERE user_id = ?",
        [&req.user_id],
    )
    .map_err(db_write("db_update_failed", "students"))?;
    tx.execute("DELETE FROM users WHERE id = ?", [&req.user_id])
        .map_err(db_write("db_delete_failed", "users"))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "users.list" => Some(with_conn(state, req, users_list)),
        "users.create" => Some(with_conn(state, req, users_create)),
        "users.update" => Some(with_conn(state, req, users_update)),
        "users.delete" => Some(with_conn(state, req, users_delete)),
        _ => None,
    }
}
