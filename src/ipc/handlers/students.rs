use crate::domain::Role;
use crate::ipc::helpers::{
    db_query, db_write, double_option, like_pattern, optional_text, parse_params, require_row,
    required_text, today_iso, with_conn, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

const BULK_CREATE_MAX_NAMES: usize = 500;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListStudents {
    class_id: String,
    search: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateStudent {
    class_id: Option<String>,
    name: String,
    enrollment_no: Option<String>,
    guardian_email: Option<String>,
    guardian_phone: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BulkCreateStudents {
    class_id: String,
    names: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateStudent {
    student_id: String,
    name: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    class_id: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    enrollment_no: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    guardian_email: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    guardian_phone: Option<Option<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LinkUser {
    student_id: String,
    user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StudentRef {
    student_id: String,
}

/// Student entity as stored; requests are mapped onto it field by field.
#[derive(Debug, Clone)]
pub struct Student {
    pub id: String,
    pub class_id: Option<String>,
    pub name: String,
    pub enrollment_no: Option<String>,
    pub registered_on: String,
    pub guardian_email: Option<String>,
    pub guardian_phone: Option<String>,
    pub user_id: Option<String>,
}

impl Student {
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "classId": self.class_id,
            "name": self.name,
            "enrollmentNo": self.enrollment_no,
            "registeredOn": self.registered_on,
            "guardianEmail": self.guardian_email,
            "guardianPhone": self.guardian_phone,
            "userId": self.user_id,
        })
    }
}

const STUDENT_COLUMNS: &str =
    "id, class_id, name, enrollment_no, registered_on, guardian_email, guardian_phone, user_id";

fn read_student(r: &rusqlite::Row<'_>) -> rusqlite::Result<Student> {
    Ok(Student {
        id: r.get(0)?,
        class_id: r.get(1)?,
        name: r.get(2)?,
        enrollment_no: r.get(3)?,
        registered_on: r.get(4)?,
        guardian_email: r.get(5)?,
        guardian_phone: r.get(6)?,
        user_id: r.get(7)?,
    })
}

pub fn load_student(conn: &Connection, student_id: &str) -> Result<Option<Student>, HandlerErr> {
    let sql = format!("SELECT {} FROM students WHERE id = ?", STUDENT_COLUMNS);
    conn.query_row(&sql, [student_id], read_student)
        .optional()
        .map_err(db_query)
}

fn insert_student(conn: &Connection, s: &Student) -> Result<(), HandlerErr> {
    conn.execute(
        "INSERT INTO students(id, class_id, name, enrollment_no, registered_on, guardian_email, guardian_phone, user_id)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &s.id,
            &s.class_id,
            &s.name,
            &s.enrollment_no,
            &s.registered_on,
            &s.guardian_email,
            &s.guardian_phone,
            &s.user_id,
        ),
    )
    .map_err(db_write("db_insert_failed", "students"))?;
    Ok(())
}

fn students_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let req: ListStudents = parse_params(params)?;
    require_row(conn, "classes", &req.class_id, "class")?;
    let pattern = like_pattern(req.search.as_deref());

    let sql = format!(
        "SELECT {} FROM students
         WHERE class_id = ?1 AND (?2 IS NULL OR lower(name) LIKE ?2 ESCAPE '\\')
         ORDER BY name",
        STUDENT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql).map_err(db_query)?;
    let students = stmt
        .query_map((&req.class_id, &pattern), read_student)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    let students: Vec<serde_json::Value> = students.iter().map(Student::to_json).collect();
    Ok(json!({ "students": students }))
}

fn students_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let req: CreateStudent = parse_params(params)?;
    let class_id = optional_text(req.class_id);
    if let Some(cid) = class_id.as_deref() {
        require_row(conn, "classes", cid, "class")?;
    }
    let student = Student {
        id: Uuid::new_v4().to_string(),
        class_id,
        name: required_text(&req.name, "name", 100)?,
        enrollment_no: optional_text(req.enrollment_no),
        registered_on: today_iso(),
        guardian_email: optional_text(req.guardian_email),
        guardian_phone: optional_text(req.guardian_phone),
        user_id: None,
    };
    insert_student(conn, &student)?;
    Ok(json!({ "studentId": student.id, "student": student.to_json() }))
}

fn students_bulk_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let req: BulkCreateStudents = parse_params(params)?;
    require_row(conn, "classes", &req.class_id, "class")?;
    if req.names.is_empty() {
        return Err(HandlerErr::bad_params("names must not be empty"));
    }
    if req.names.len() > BULK_CREATE_MAX_NAMES {
        return Err(HandlerErr::bad_params("too many names").with_details(json!({
            "max": BULK_CREATE_MAX_NAMES,
            "received": req.names.len()
        })));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let registered_on = today_iso();
    let mut created: Vec<String> = Vec::new();
    for raw in &req.names {
        // Blank lines in pasted rosters are skipped.
        let Some(name) = optional_text(Some(raw.clone())) else {
            continue;
        };
        let name = required_text(&name, "name", 100)?;
        let student = Student {
            id: Uuid::new_v4().to_string(),
            class_id: Some(req.class_id.clone()),
            name,
            enrollment_no: None,
            registered_on: registered_on.clone(),
            guardian_email: None,
            guardian_phone: None,
            user_id: None,
        };
        insert_student(&tx, &student)?;
        created.push(student.id);
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "created": created.len(), "studentIds": created }))
}

fn students_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let req: UpdateStudent = parse_params(params)?;
    let Some(mut student) = load_student(conn, &req.student_id)? else {
        return Err(HandlerErr::not_found("student"));
    };

    if let Some(raw) = req.name {
        student.name = required_text(&raw, "name", 100)?;
    }
    if let Some(class_id) = req.class_id {
        let class_id = optional_text(class_id);
        if let Some(cid) = class_id.as_deref() {
            require_row(conn, "classes", cid, "class")?;
        }
        student.class_id = class_id;
    }
    if let Some(v) = req.enrollment_no {
        student.enrollment_no = optional_text(v);
    }
    if let Some(v) = req.guardian_email {
        student.guardian_email = optional_text(v);
    }
    if let Some(v) = req.guardian_phone {
        student.guardian_phone = optional_text(v);
    }

    conn.execute(
        "UPDATE students
         SET class_id = ?, name = ?, enrollment_no = ?, guardian_email = ?, guardian_phone = ?
         WHERE id = ?",
        (
            &student.class_id,
            &student.name,
            &student.enrollment_no,
            &student.guardian_email,
            &student.guardian_phone,
            &student.id,
        ),
    )
    .map_err(db_write("db_update_failed", "students"))?;
    Ok(json!({ "student": student.to_json() }))
}

fn students_link_user(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let req: LinkUser = parse_params(params)?;
    require_row(conn, "students", &req.student_id, "student")?;

    if let Some(user_id) = req.user_id.as_deref() {
        let role: Option<String> = conn
            .query_row("SELECT role FROM users WHERE id = ?", [user_id], |r| r.get(0))
            .optional()
            .map_err(db_query)?;
        let Some(role) = role else {
            return Err(HandlerErr::not_found("user"));
        };
        if Role::parse(&role) != Some(Role::Student) {
            return Err(HandlerErr::bad_params("only student accounts can be linked"));
        }
        let other: Option<String> = conn
            .query_row(
                "SELECT id FROM students WHERE user_id = ? AND id <> ?",
                (user_id, &req.student_id),
                |r| r.get(0),
            )
            .optional()
            .map_err(db_query)?;
        if let Some(other) = other {
            return Err(HandlerErr::new("conflict", "user is linked to another student")
                .with_details(json!({ "studentId": other })));
        }
    }

    conn.execute(
        "UPDATE students SET user_id = ? WHERE id = ?",
        (&req.user_id, &req.student_id),
    )
    .map_err(db_write("db_update_failed", "students"))?;
    Ok(json!({ "studentId": req.student_id, "userId": req.user_id }))
}

fn students_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let req: StudentRef = parse_params(params)?;
    require_row(conn, "students", &req.student_id, "student")?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let removed_scores = tx
        .execute("DELETE FROM scores WHERE student_id = ?", [&req.student_id])
        .map_err(db_write("db_delete_failed", "scores"))?;
    tx.execute("DELETE FROM students WHERE id = ?", [&req.student_id])
        .map_err(db_write("db_delete_failed", "students"))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "ok": true, "removedScores": removed_scores }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(with_conn(state, req, students_list)),
        "students.create" => Some(with_conn(state, req, students_create)),
        "students.bulkCreate" => Some(with_conn(state, req, students_bulk_create)),
        "students.update" => Some(with_conn(state, req, students_update)),
        "students.linkUser" => Some(with_conn(state, req, students_link_user)),
        "students.delete" => Some(with_conn(state, req, students_delete)),
        _ => None,
    }
}
