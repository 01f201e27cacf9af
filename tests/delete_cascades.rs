use rusqlite::Connection;
use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_boletimd");
    let mut child = Command::new(exe)
        .env_remove("BOLETIMD_WORKSPACE")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn boletimd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn request_err_code(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> String {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

fn str_field(v: &serde_json::Value, key: &str) -> String {
    v.get(key)
        .and_then(|x| x.as_str())
        .unwrap_or_else(|| panic!("missing {} in {}", key, v))
        .to_string()
}

fn count(conn: &Connection, sql: &str, id: &str) -> i64 {
    conn.query_row(sql, [id], |r| r.get(0)).expect("count query")
}

#[test]
fn deleting_a_class_removes_its_records_and_detaches_students() {
    let workspace = temp_dir("boletim-class-delete");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let teacher = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "users.create",
        json!({ "username": "prof.lucas", "role": "teacher" }),
    );
    let teacher_id = str_field(&teacher, "userId");
    let class = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "classes.create",
        json!({ "name": "1º Ano EM", "ownerId": teacher_id }),
    );
    let class_id = str_field(&class, "classId");
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.create",
        json!({ "classId": class_id, "name": "Joana Pires" }),
    );
    let student_id = str_field(&student, "studentId");
    let activity = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "activities.create",
        json!({ "classId": class_id, "title": "Trabalho", "kind": "project" }),
    );
    let activity_id = str_field(&activity, "activityId");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "grades.record",
        json!({
            "studentId": student_id,
            "activityId": activity_id,
            "status": "present",
            "participation": "full",
            "value": 9.0,
            "performance": 95
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "plans.create",
        json!({ "classId": class_id, "plannedOn": "2024-04-02", "title": "Frações" }),
    );

    // Owner cannot be removed while the class exists.
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "8",
        "users.delete",
        json!({ "userId": teacher_id }),
    );
    assert_eq!(code, "conflict");

    let res = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "classes.delete",
        json!({ "classId": class_id }),
    );
    assert_eq!(res.get("detachedStudents").and_then(|v| v.as_u64()), Some(1));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "users.delete",
        json!({ "userId": teacher_id }),
    );

    drop(stdin);
    let _ = child.wait();

    let conn = Connection::open(workspace.join("boletim.sqlite3")).expect("open db");
    assert_eq!(
        count(&conn, "SELECT COUNT(*) FROM activities WHERE class_id = ?", &class_id),
        0
    );
    assert_eq!(
        count(&conn, "SELECT COUNT(*) FROM scores WHERE activity_id = ?", &activity_id),
        0
    );
    assert_eq!(
        count(&conn, "SELECT COUNT(*) FROM lesson_plans WHERE class_id = ?", &class_id),
        0
    );
    let class_of_student: Option<String> = conn
        .query_row(
            "SELECT class_id FROM students WHERE id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .expect("student still exists");
    assert_eq!(class_of_student, None);
}

#[test]
fn deleting_students_and_activities_removes_their_scores() {
    let workspace = temp_dir("boletim-row-delete");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let teacher = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "users.create",
        json!({ "username": "prof.rita", "role": "teacher" }),
    );
    let class = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "classes.create",
        json!({ "name": "2º Ano EM", "ownerId": str_field(&teacher, "userId") }),
    );
    let class_id = str_field(&class, "classId");
    let bulk = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.bulkCreate",
        json!({ "classId": class_id, "names": ["Kaio Lopes", "Lara Mendes"] }),
    );
    let ids: Vec<String> = bulk
        .get("studentIds")
        .and_then(|v| v.as_array())
        .expect("studentIds")
        .iter()
        .filter_map(|v| v.as_str().map(|s| s.to_string()))
        .collect();
    let mut activity_ids = Vec::new();
    for (n, title) in ["Visto 1", "Visto 2"].iter().enumerate() {
        let res = request_ok(
            &mut stdin,
            &mut reader,
            &format!("5-{}", n),
            "activities.create",
            json!({ "classId": class_id, "title": title, "kind": "notebook_check", "weight": 1.0 }),
        );
        activity_ids.push(str_field(&res, "activityId"));
    }
    for (i, student_id) in ids.iter().enumerate() {
        for (j, activity_id) in activity_ids.iter().enumerate() {
            let _ = request_ok(
                &mut stdin,
                &mut reader,
                &format!("6-{}-{}", i, j),
                "grades.record",
                json!({
                    "studentId": student_id,
                    "activityId": activity_id,
                    "status": "present",
                    "participation": "full",
                    "value": 1.0,
                    "performance": 100
                }),
            );
        }
    }

    let res = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "students.delete",
        json!({ "studentId": ids[0] }),
    );
    assert_eq!(res.get("removedScores").and_then(|v| v.as_u64()), Some(2));
    let res = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "activities.delete",
        json!({ "activityId": activity_ids[0] }),
    );
    assert_eq!(res.get("removedScores").and_then(|v| v.as_u64()), Some(1));

    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "9",
        "students.delete",
        json!({ "studentId": ids[0] }),
    );
    assert_eq!(code, "not_found");

    drop(stdin);
    let _ = child.wait();

    let conn = Connection::open(workspace.join("boletim.sqlite3")).expect("open db");
    let remaining: i64 = conn
        .query_row("SELECT COUNT(*) FROM scores", [], |r| r.get(0))
        .expect("count scores");
    assert_eq!(remaining, 1);
}
