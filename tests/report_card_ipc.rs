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

fn f64_at(v: &serde_json::Value, pointer: &str) -> f64 {
    v.pointer(pointer)
        .and_then(|x| x.as_f64())
        .unwrap_or_else(|| panic!("missing number at {} in {}", pointer, v))
}

fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

fn seed_class(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> String {
    let teacher = request_ok(
        stdin,
        reader,
        "seed-teacher",
        "users.create",
        json!({ "username": "prof.ana", "role": "teacher" }),
    );
    let class = request_ok(
        stdin,
        reader,
        "seed-class",
        "classes.create",
        json!({ "name": "7º Ano A", "ownerId": str_field(&teacher, "userId") }),
    );
    str_field(&class, "classId")
}

fn create_activity(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    class_id: &str,
    period: &str,
    weight: f64,
) -> String {
    let res = request_ok(
        stdin,
        reader,
        id,
        "activities.create",
        json!({
            "classId": class_id,
            "title": format!("Atividade {}", id),
            "kind": "activity",
            "period": period,
            "weight": weight,
            "date": "2024-03-10"
        }),
    );
    str_field(&res, "activityId")
}

fn grade(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    student_id: &str,
    activity_id: &str,
    value: Option<f64>,
) {
    let mut params = json!({
        "studentId": student_id,
        "activityId": activity_id,
        "status": "present",
        "participation": "full",
        "performance": 70
    });
    match value {
        Some(v) => params["value"] = json!(v),
        None => params["ungraded"] = json!(true),
    }
    let _ = request_ok(stdin, reader, id, "grades.record", params);
}

#[test]
fn report_card_weights_periods_and_averages_period_means() {
    let workspace = temp_dir("boletim-report-card");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class_id = seed_class(&mut stdin, &mut reader);
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.create",
        json!({ "classId": class_id, "name": "Bruno Lima" }),
    );
    let student_id = str_field(&student, "studentId");

    let a1 = create_activity(&mut stdin, &mut reader, "3", &class_id, "1ª Unidade", 10.0);
    let a2 = create_activity(&mut stdin, &mut reader, "4", &class_id, "1ª Unidade", 6.0);
    // Weight 0 counts as 1.
    let a3 = create_activity(&mut stdin, &mut reader, "5", &class_id, "2ª Unidade", 0.0);
    let a4 = create_activity(&mut stdin, &mut reader, "6", &class_id, "2ª Unidade", 4.0);

    grade(&mut stdin, &mut reader, "7", &student_id, &a1, Some(8.0));
    grade(&mut stdin, &mut reader, "8", &student_id, &a2, Some(5.5));
    grade(&mut stdin, &mut reader, "9", &student_id, &a3, Some(7.25));
    grade(&mut stdin, &mut reader, "10", &student_id, &a4, None);

    let card = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "reports.reportCard",
        json!({ "studentId": student_id }),
    );

    // (8*10 + 5.5*6) / 16 = 7.0625
    assert!(approx(f64_at(&card, "/periods/1ª Unidade/numerator"), 113.0));
    assert!(approx(f64_at(&card, "/periods/1ª Unidade/denominator"), 16.0));
    assert!(approx(f64_at(&card, "/periods/1ª Unidade/average"), 7.1));
    // Ungraded record is excluded; 7.25 rounds half up.
    assert!(approx(f64_at(&card, "/periods/2ª Unidade/denominator"), 1.0));
    assert!(approx(f64_at(&card, "/periods/2ª Unidade/average"), 7.3));
    let periods = card
        .get("periods")
        .and_then(|v| v.as_object())
        .expect("periods object");
    assert_eq!(periods.len(), 2);
    let ordered: Vec<&str> = card
        .get("ordered")
        .and_then(|v| v.as_array())
        .expect("ordered periods")
        .iter()
        .filter_map(|p| p.get("period").and_then(|v| v.as_str()))
        .collect();
    assert_eq!(ordered, vec!["1ª Unidade", "2ª Unidade"]);
    assert!(approx(f64_at(&card, "/overall"), 7.2));

    // Same inputs, same answer.
    let again = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "reports.reportCard",
        json!({ "studentId": student_id }),
    );
    assert_eq!(card, again);

    drop(stdin);
    let _ = child.wait();

    let conn = Connection::open(workspace.join("boletim.sqlite3")).expect("open db");
    let ungraded: Option<f64> = conn
        .query_row(
            "SELECT value FROM scores WHERE student_id = ? AND activity_id = ?",
            (&student_id, &a4),
            |r| r.get(0),
        )
        .expect("ungraded score row");
    assert_eq!(ungraded, None);
}

#[test]
fn zero_is_a_real_grade_and_overall_counts_each_period_once() {
    let workspace = temp_dir("boletim-report-zero");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class_id = seed_class(&mut stdin, &mut reader);
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.create",
        json!({ "classId": class_id, "name": "Carla Souza" }),
    );
    let student_id = str_field(&student, "studentId");

    let a1 = create_activity(&mut stdin, &mut reader, "3", &class_id, "1ª Unidade", 10.0);
    let a2 = create_activity(&mut stdin, &mut reader, "4", &class_id, "3ª Unidade", 1.0);
    grade(&mut stdin, &mut reader, "5", &student_id, &a1, Some(9.0));
    grade(&mut stdin, &mut reader, "6", &student_id, &a2, Some(0.0));

    let card = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "reports.reportCard",
        json!({ "studentId": student_id }),
    );
    assert!(approx(f64_at(&card, "/periods/3ª Unidade/average"), 0.0));
    // Heavy first period does not dominate: (9.0 + 0.0) / 2.
    assert!(approx(f64_at(&card, "/overall"), 4.5));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn student_without_grades_gets_empty_card_and_unknown_period_falls_back_to_first() {
    let workspace = temp_dir("boletim-report-empty");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class_id = seed_class(&mut stdin, &mut reader);
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.create",
        json!({ "classId": class_id, "name": "Diego Alves" }),
    );
    let student_id = str_field(&student, "studentId");

    let empty = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "reports.reportCard",
        json!({ "studentId": student_id }),
    );
    assert_eq!(
        empty.get("periods").and_then(|v| v.as_object()).map(|m| m.len()),
        Some(0)
    );
    assert!(approx(f64_at(&empty, "/overall"), 0.0));

    let odd = create_activity(&mut stdin, &mut reader, "4", &class_id, "Bimestre 9", 5.0);
    grade(&mut stdin, &mut reader, "5", &student_id, &odd, Some(4.0));
    let card = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "reports.reportCard",
        json!({ "studentId": student_id }),
    );
    assert!(approx(f64_at(&card, "/periods/1ª Unidade/average"), 4.0));

    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "7",
        "reports.reportCard",
        json!({ "studentId": "missing" }),
    );
    assert_eq!(code, "not_found");

    drop(stdin);
    let _ = child.wait();

    let conn = Connection::open(workspace.join("boletim.sqlite3")).expect("open db");
    let period: String = conn
        .query_row("SELECT period FROM activities WHERE id = ?", [&odd], |r| {
            r.get(0)
        })
        .expect("activity period");
    assert_eq!(period, "1ª Unidade");
}
