use crate::domain::{AttendanceStatus, GradingPeriod, Standing};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

/// One-decimal rounding, `floor(10*x + 0.5) / 10`, applied to the f64 value
/// as computed. Halves round up for the non-negative figures this module
/// produces, but an average whose exact value is a half can be computed a
/// hair below it and then rounds down.
///
/// 7.25 rounds to 7.3, 7.24 to 7.2, and (0.3*3 + 1.7*1) / 4, computed as
/// 0.6499999999999999, to 0.6.
pub fn round_off_1_decimal(x: f64) -> f64 {
    ((10.0 * x) + 0.5).floor() / 10.0
}

/// Same convention at two decimals, used for scores derived from correct answers.
pub fn round_off_2_decimals(x: f64) -> f64 {
    ((100.0 * x) + 0.5).floor() / 100.0
}

/// Activity weight used as both multiplier and divisor. Missing, zero or
/// unusable weights count as 1.
pub fn effective_weight(weight: Option<f64>) -> f64 {
    match weight {
        Some(w) if w.is_finite() && w > 0.0 => w,
        _ => 1.0,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    fn db(e: rusqlite::Error) -> Self {
        Self::new("db_query_failed", e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Report card
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActivityRef {
    pub weight: Option<f64>,
    pub period: GradingPeriod,
}

/// A score record joined to its activity. `activity` is `None` when the
/// record points at an activity that no longer exists.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradedRow {
    pub value: Option<f64>,
    pub activity: Option<ActivityRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodTotals {
    pub numerator: f64,
    pub denominator: f64,
    pub average: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportCard {
    pub periods: BTreeMap<GradingPeriod, PeriodTotals>,
    pub overall: f64,
}

pub fn report_card<I>(rows: I) -> ReportCard
where
    I: IntoIterator<Item = GradedRow>,
{
    let mut periods: BTreeMap<GradingPeriod, PeriodTotals> = BTreeMap::new();

    for row in rows {
        let Some(value) = row.value else {
            continue;
        };
        if !value.is_finite() {
            continue;
        }
        let Some(activity) = row.activity else {
            continue;
        };
        let weight = effective_weight(activity.weight);
        let entry = periods.entry(activity.period).or_insert(PeriodTotals {
            numerator: 0.0,
            denominator: 0.0,
            average: 0.0,
        });
        entry.numerator += value * weight;
        entry.denominator += weight;
    }

    let mut sum_averages = 0.0_f64;
    let mut counted = 0_usize;
    for totals in periods.values_mut() {
        if totals.denominator <= 0.0 {
            continue;
        }
        totals.average = round_off_1_decimal(totals.numerator / totals.denominator);
        sum_averages += totals.average;
        counted += 1;
    }

    // Each qualifying period counts once, whatever its weight.
    let overall = if counted > 0 {
        round_off_1_decimal(sum_averages / (counted as f64))
    } else {
        0.0
    };

    ReportCard { periods, overall }
}

// ---------------------------------------------------------------------------
// Attendance
// ---------------------------------------------------------------------------

/// Which attendance ratio a screen uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AttendancePolicy {
    /// present / (present + absent); excused rows are ignored; no rows => 100.
    Portal,
    /// (present + excused) / all rows; no rows => 0.
    Dashboard,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceCounts {
    pub present: usize,
    pub absent: usize,
    pub excused: usize,
    /// Rows whose status could not be read.
    pub other: usize,
}

impl AttendanceCounts {
    pub fn tally<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = Option<AttendanceStatus>>,
    {
        let mut c = Self::default();
        for s in statuses {
            match s {
                Some(AttendanceStatus::Present) => c.present += 1,
                Some(AttendanceStatus::Absent) => c.absent += 1,
                Some(AttendanceStatus::Excused) => c.excused += 1,
                None => c.other += 1,
            }
        }
        c
    }

    pub fn total(&self) -> usize {
        self.present + self.absent + self.excused + self.other
    }

    pub fn percentage(&self, policy: AttendancePolicy) -> f64 {
        match policy {
            AttendancePolicy::Portal => {
                let denom = self.present + self.absent;
                if denom == 0 {
                    return 100.0;
                }
                round_off_1_decimal(100.0 * (self.present as f64) / (denom as f64))
            }
            AttendancePolicy::Dashboard => {
                let total = self.total();
                if total == 0 {
                    return 0.0;
                }
                round_off_1_decimal(100.0 * ((self.present + self.excused) as f64) / (total as f64))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceSummary {
    pub policy: AttendancePolicy,
    pub counts: AttendanceCounts,
    pub percentage: f64,
}

// ---------------------------------------------------------------------------
// Class roll-up
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StudentPerformanceInput {
    pub student_id: String,
    pub name: String,
    /// One entry per score record the student has in the class.
    pub performances: Vec<Option<i64>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentPerformance {
    pub student_id: String,
    pub name: String,
    pub performance: f64,
    pub has_data: bool,
    pub bucket: Option<Standing>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketCounts {
    pub excellent: usize,
    pub good: usize,
    pub needs_improvement: usize,
    pub unsatisfactory: usize,
}

impl BucketCounts {
    fn add(&mut self, s: Standing) {
        match s {
            Standing::Excellent => self.excellent += 1,
            Standing::Good => self.good += 1,
            Standing::NeedsImprovement => self.needs_improvement += 1,
            Standing::Unsatisfactory => self.unsatisfactory += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassRollup {
    pub students: Vec<StudentPerformance>,
    pub buckets: BucketCounts,
    pub class_average: f64,
    pub total_students: usize,
}

pub fn class_rollup<I>(inputs: I) -> ClassRollup
where
    I: IntoIterator<Item = StudentPerformanceInput>,
{
    let mut students = Vec::new();
    let mut buckets = BucketCounts::default();
    let mut sum = 0.0_f64;

    for input in inputs {
        let has_data = !input.performances.is_empty();
        // Records without an estimate still count in the denominator.
        let performance = if has_data {
            let total: i64 = input.performances.iter().flatten().sum();
            (total as f64) / (input.performances.len() as f64)
        } else {
            0.0
        };
        let bucket = has_data.then(|| Standing::from_performance(performance));
        if let Some(b) = bucket {
            buckets.add(b);
        }
        // No-data students still pull the class mean down.
        sum += performance;
        students.push(StudentPerformance {
            student_id: input.student_id,
            name: input.name,
            performance,
            has_data,
            bucket,
        });
    }

    let total_students = students.len();
    let class_average = if total_students > 0 {
        sum / (total_students as f64)
    } else {
        0.0
    };

    ClassRollup {
        students,
        buckets,
        class_average,
        total_students,
    }
}

// ---------------------------------------------------------------------------
// Points views (sum of obtained points, no weighting)
// ---------------------------------------------------------------------------

/// Last period in academic order that has at least one activity.
pub fn focused_period<I>(periods: I) -> GradingPeriod
where
    I: IntoIterator<Item = GradingPeriod>,
{
    periods.into_iter().max().unwrap_or(GradingPeriod::First)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointsRow {
    pub period: GradingPeriod,
    pub weight: Option<f64>,
    /// `None` when the student has no record or the record is ungraded.
    pub value: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodPoints {
    pub period: GradingPeriod,
    pub activity_count: usize,
    pub obtained: f64,
    pub maximum: f64,
    pub has_data: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PointsBreakdown {
    pub periods: Vec<PeriodPoints>,
    pub obtained_total: f64,
    pub maximum_total: f64,
}

/// Per-period obtained vs maximum points over every activity listed, in
/// period order. All six periods are present in the output.
pub fn points_breakdown<I>(rows: I) -> PointsBreakdown
where
    I: IntoIterator<Item = PointsRow>,
{
    let mut periods: Vec<PeriodPoints> = GradingPeriod::ALL
        .into_iter()
        .map(|period| PeriodPoints {
            period,
            activity_count: 0,
            obtained: 0.0,
            maximum: 0.0,
            has_data: false,
        })
        .collect();
    let mut obtained_total = 0.0_f64;
    let mut maximum_total = 0.0_f64;

    for row in rows {
        let Some(slot) = periods.iter_mut().find(|p| p.period == row.period) else {
            continue;
        };
        let value = row.value.filter(|v| v.is_finite()).unwrap_or(0.0);
        let weight = row.weight.filter(|w| w.is_finite()).unwrap_or(0.0);
        slot.activity_count += 1;
        slot.obtained += value;
        slot.maximum += weight;
        slot.has_data = true;
        obtained_total += value;
        maximum_total += weight;
    }

    PointsBreakdown {
        periods,
        obtained_total,
        maximum_total,
    }
}

/// Unweighted mean of recorded values, one decimal; 0 when there are none.
pub fn simple_mean<I>(values: I) -> f64
where
    I: IntoIterator<Item = f64>,
{
    let mut sum = 0.0_f64;
    let mut n = 0_usize;
    for v in values.into_iter().filter(|v| v.is_finite()) {
        sum += v;
        n += 1;
    }
    if n == 0 {
        0.0
    } else {
        round_off_1_decimal(sum / (n as f64))
    }
}

/// Obtained over maximum as a percentage; `None` when nothing was possible.
pub fn score_percentage(obtained: f64, maximum: f64) -> Option<f64> {
    if maximum > 0.0 {
        Some(100.0 * obtained / maximum)
    } else {
        None
    }
}

/// Value derived from the number of correct answers, scaled to the
/// activity's point value.
pub fn value_from_correct_answers(correct: i64, questions: i64, weight: Option<f64>) -> Option<f64> {
    if questions <= 0 || correct < 0 || correct > questions {
        return None;
    }
    let w = weight.filter(|w| w.is_finite() && *w >= 0.0).unwrap_or(0.0);
    Some(round_off_2_decimals((correct as f64) / (questions as f64) * w))
}

// ---------------------------------------------------------------------------
// Loaders
// ---------------------------------------------------------------------------

fn student_class(conn: &Connection, student_id: &str) -> Result<Option<String>, CalcError> {
    let row: Option<Option<String>> = conn
        .query_row(
            "SELECT class_id FROM students WHERE id = ?",
            [student_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(CalcError::db)?;
    row.ok_or_else(|| CalcError::new("not_found", "student not found"))
}

pub fn load_report_card(conn: &Connection, student_id: &str) -> Result<ReportCard, CalcError> {
    student_class(conn, student_id)?;

    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.value, a.id, a.weight, a.period
             FROM scores s
             LEFT JOIN activities a ON a.id = s.activity_id
             WHERE s.student_id = ? AND s.value IS NOT NULL",
        )
        .map_err(CalcError::db)?;
    let rows = stmt
        .query_map([student_id], |r| {
            let score_id: String = r.get(0)?;
            let value: Option<f64> = r.get(1)?;
            let activity_id: Option<String> = r.get(2)?;
            let weight: Option<f64> = r.get(3)?;
            let period: Option<String> = r.get(4)?;
            Ok((score_id, value, activity_id, weight, period))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(CalcError::db)?;

    let graded = rows
        .into_iter()
        .map(|(score_id, value, activity_id, weight, period)| {
            let activity = match activity_id {
                Some(_) => Some(ActivityRef {
                    weight,
                    period: GradingPeriod::from_label_or_first(period.as_deref()),
                }),
                None => {
                    log::warn!("score {score_id} references a missing activity; skipped");
                    None
                }
            };
            GradedRow { value, activity }
        });

    Ok(report_card(graded))
}

pub fn load_attendance(
    conn: &Connection,
    student_id: &str,
    policy: AttendancePolicy,
) -> Result<AttendanceSummary, CalcError> {
    let Some(class_id) = student_class(conn, student_id)? else {
        let counts = AttendanceCounts::default();
        return Ok(AttendanceSummary {
            policy,
            counts,
            percentage: counts.percentage(policy),
        });
    };

    let mut stmt = conn
        .prepare(
            "SELECT s.status
             FROM scores s
             JOIN activities a ON a.id = s.activity_id
             WHERE s.student_id = ? AND a.class_id = ?",
        )
        .map_err(CalcError::db)?;
    let statuses = stmt
        .query_map((student_id, &class_id), |r| r.get::<_, Option<String>>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(CalcError::db)?;

    let counts = AttendanceCounts::tally(
        statuses
            .iter()
            .map(|s| s.as_deref().and_then(AttendanceStatus::parse)),
    );
    Ok(AttendanceSummary {
        policy,
        counts,
        percentage: counts.percentage(policy),
    })
}

pub fn load_class_rollup(conn: &Connection, class_id: &str) -> Result<ClassRollup, CalcError> {
    let mut students_stmt = conn
        .prepare("SELECT id, name FROM students WHERE class_id = ? ORDER BY name")
        .map_err(CalcError::db)?;
    let students: Vec<(String, String)> = students_stmt
        .query_map([class_id], |r| Ok((r.get(0)?, r.get(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(CalcError::db)?;

    let mut perf_stmt = conn
        .prepare(
            "SELECT s.student_id, s.performance
             FROM scores s
             JOIN activities a ON a.id = s.activity_id
             JOIN students st ON st.id = s.student_id
             WHERE a.class_id = ? AND st.class_id = ?",
        )
        .map_err(CalcError::db)?;
    let rows: Vec<(String, Option<i64>)> = perf_stmt
        .query_map((class_id, class_id), |r| Ok((r.get(0)?, r.get(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(CalcError::db)?;

    let mut by_student: HashMap<String, Vec<Option<i64>>> = HashMap::new();
    for (student_id, performance) in rows {
        by_student.entry(student_id).or_default().push(performance);
    }

    Ok(class_rollup(students.into_iter().map(|(id, name)| {
        let performances = by_student.remove(&id).unwrap_or_default();
        StudentPerformanceInput {
            student_id: id,
            name,
            performances,
        }
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graded(value: Option<f64>, weight: Option<f64>, period: GradingPeriod) -> GradedRow {
        GradedRow {
            value,
            activity: Some(ActivityRef { weight, period }),
        }
    }

    #[test]
    fn round_off_is_half_up() {
        assert_eq!(round_off_1_decimal(0.0), 0.0);
        assert_eq!(round_off_1_decimal(7.25), 7.3);
        assert_eq!(round_off_1_decimal(7.24), 7.2);
        assert_eq!(round_off_1_decimal(7.75), 7.8);
        assert_eq!(round_off_1_decimal(1.45), 1.5);
        // Exactly 0.65 on paper, one ulp below it in f64.
        let weighted = (0.3 * 3.0 + 1.7 * 1.0) / 4.0;
        assert!(weighted < 0.65);
        assert_eq!(round_off_1_decimal(weighted), 0.6);
        assert_eq!(round_off_2_decimals(6.125), 6.13);
    }

    #[test]
    fn empty_report_card_is_zero() {
        let rc = report_card(Vec::new());
        assert!(rc.periods.is_empty());
        assert_eq!(rc.overall, 0.0);
    }

    #[test]
    fn single_activity_average_is_its_value() {
        let rc = report_card(vec![graded(Some(7.0), Some(10.0), GradingPeriod::First)]);
        let first = rc.periods.get(&GradingPeriod::First).expect("first period");
        assert_eq!(first.numerator, 70.0);
        assert_eq!(first.denominator, 10.0);
        assert_eq!(first.average, 7.0);
        assert_eq!(rc.overall, 7.0);
    }

    #[test]
    fn overall_is_blind_to_period_weight() {
        let rc = report_card(vec![
            graded(Some(8.0), Some(10.0), GradingPeriod::First),
            graded(Some(4.0), Some(1.0), GradingPeriod::Second),
        ]);
        assert_eq!(rc.periods[&GradingPeriod::First].average, 8.0);
        assert_eq!(rc.periods[&GradingPeriod::Second].average, 4.0);
        assert_eq!(rc.overall, 6.0);
    }

    #[test]
    fn within_period_values_are_weighted() {
        let rc = report_card(vec![
            graded(Some(8.0), Some(2.0), GradingPeriod::Third),
            graded(Some(5.0), Some(1.0), GradingPeriod::Third),
        ]);
        assert_eq!(rc.periods[&GradingPeriod::Third].average, 7.0);
    }

    #[test]
    fn ungraded_and_orphaned_rows_are_skipped() {
        let rc = report_card(vec![
            graded(Some(6.0), Some(2.0), GradingPeriod::First),
            graded(None, Some(8.0), GradingPeriod::First),
            GradedRow {
                value: Some(10.0),
                activity: None,
            },
        ]);
        let first = rc.periods[&GradingPeriod::First];
        assert_eq!(first.denominator, 2.0);
        assert_eq!(first.average, 6.0);
        assert_eq!(rc.periods.len(), 1);
    }

    #[test]
    fn zero_is_a_real_grade_and_zero_weight_counts_as_one() {
        let rc = report_card(vec![
            graded(Some(0.0), Some(0.0), GradingPeriod::Fourth),
            graded(Some(9.0), None, GradingPeriod::Fourth),
        ]);
        let p = rc.periods[&GradingPeriod::Fourth];
        assert_eq!(p.numerator, 9.0);
        assert_eq!(p.denominator, 2.0);
        assert_eq!(p.average, 4.5);
    }

    #[test]
    fn portal_attendance_ignores_excused_and_defaults_to_full() {
        let c = AttendanceCounts::tally(vec![
            Some(AttendanceStatus::Present),
            Some(AttendanceStatus::Present),
            Some(AttendanceStatus::Present),
            Some(AttendanceStatus::Absent),
            Some(AttendanceStatus::Excused),
        ]);
        assert_eq!(c.percentage(AttendancePolicy::Portal), 75.0);
        assert_eq!(c.percentage(AttendancePolicy::Dashboard), 80.0);

        let empty = AttendanceCounts::default();
        assert_eq!(empty.percentage(AttendancePolicy::Portal), 100.0);
        assert_eq!(empty.percentage(AttendancePolicy::Dashboard), 0.0);
    }

    #[test]
    fn rollup_excludes_no_data_from_buckets_but_not_from_average() {
        let r = class_rollup(vec![
            StudentPerformanceInput {
                student_id: "a".into(),
                name: "Ana".into(),
                performances: vec![Some(90), Some(70)],
            },
            StudentPerformanceInput {
                student_id: "b".into(),
                name: "Bruno".into(),
                performances: vec![Some(50), None],
            },
            StudentPerformanceInput {
                student_id: "c".into(),
                name: "Carla".into(),
                performances: vec![],
            },
        ]);
        assert_eq!(r.total_students, 3);
        assert_eq!(r.students[0].performance, 80.0);
        assert_eq!(r.students[1].performance, 25.0);
        assert!(!r.students[2].has_data);
        assert_eq!(r.students[2].bucket, None);
        assert_eq!(
            r.buckets,
            BucketCounts {
                excellent: 1,
                good: 0,
                needs_improvement: 0,
                unsatisfactory: 1
            }
        );
        assert!((r.class_average - 35.0).abs() < 1e-9);
    }

    #[test]
    fn focused_period_is_last_with_activities() {
        assert_eq!(focused_period(Vec::new()), GradingPeriod::First);
        assert_eq!(
            focused_period(vec![GradingPeriod::Second, GradingPeriod::First]),
            GradingPeriod::Second
        );
    }

    #[test]
    fn points_breakdown_sums_raw_points() {
        let b = points_breakdown(vec![
            PointsRow {
                period: GradingPeriod::First,
                weight: Some(10.0),
                value: Some(7.5),
            },
            PointsRow {
                period: GradingPeriod::First,
                weight: None,
                value: None,
            },
            PointsRow {
                period: GradingPeriod::Remediation,
                weight: Some(5.0),
                value: Some(5.0),
            },
        ]);
        assert_eq!(b.periods.len(), 6);
        assert_eq!(b.periods[0].activity_count, 2);
        assert_eq!(b.periods[0].obtained, 7.5);
        assert_eq!(b.periods[0].maximum, 10.0);
        assert!(!b.periods[1].has_data);
        assert_eq!(b.obtained_total, 12.5);
        assert_eq!(b.maximum_total, 15.0);
    }

    #[test]
    fn correct_answers_scale_to_weight() {
        assert_eq!(value_from_correct_answers(6, 8, Some(10.0)), Some(7.5));
        assert_eq!(value_from_correct_answers(9, 8, Some(10.0)), None);
        assert_eq!(value_from_correct_answers(1, 0, Some(10.0)), None);
        assert_eq!(value_from_correct_answers(1, 3, Some(10.0)), Some(3.33));
    }

    #[test]
    fn simple_mean_rounds() {
        assert_eq!(simple_mean(Vec::new()), 0.0);
        assert_eq!(simple_mean(vec![7.0, 8.0, 8.0]), 7.7);
    }
}
