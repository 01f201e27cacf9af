use serde::{Deserialize, Serialize};

/// Grading periods ("unidades") in their fixed academic order.
///
/// Derived `Ord` follows declaration order, so a `BTreeMap<GradingPeriod, _>`
/// iterates the way report cards are printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum GradingPeriod {
    #[serde(rename = "1ª Unidade")]
    First,
    #[serde(rename = "2ª Unidade")]
    Second,
    #[serde(rename = "3ª Unidade")]
    Third,
    #[serde(rename = "4ª Unidade")]
    Fourth,
    #[serde(rename = "Recuperação")]
    Remediation,
    #[serde(rename = "Exame Final")]
    FinalExam,
}

impl GradingPeriod {
    pub const ALL: [GradingPeriod; 6] = [
        GradingPeriod::First,
        GradingPeriod::Second,
        GradingPeriod::Third,
        GradingPeriod::Fourth,
        GradingPeriod::Remediation,
        GradingPeriod::FinalExam,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Self::First => "1ª Unidade",
            Self::Second => "2ª Unidade",
            Self::Third => "3ª Unidade",
            Self::Fourth => "4ª Unidade",
            Self::Remediation => "Recuperação",
            Self::FinalExam => "Exame Final",
        }
    }

    /// Exact match on a stored label.
    pub fn parse(label: &str) -> Option<Self> {
        let t = label.trim();
        Self::ALL.into_iter().find(|p| p.label() == t)
    }

    /// Stored labels that are missing or unrecognized belong to the first period.
    pub fn from_label_or_first(label: Option<&str>) -> Self {
        label.and_then(Self::parse).unwrap_or(Self::First)
    }
}

/// Single role per user account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Coordinator,
    Teacher,
    Student,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Coordinator => "coordinator",
            Self::Teacher => "teacher",
            Self::Student => "student",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Some(Self::Admin),
            "coordinator" => Some(Self::Coordinator),
            "teacher" => Some(Self::Teacher),
            "student" => Some(Self::Student),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceStatus {
    Present,
    Absent,
    Excused,
}

impl AttendanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Present => "present",
            Self::Absent => "absent",
            Self::Excused => "excused",
        }
    }

    /// Accepts the canonical codes plus the labels older rows were written with.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "present" | "presente" | "p" => Some(Self::Present),
            "absent" | "ausente" | "a" => Some(Self::Absent),
            "excused" | "justificado" | "j" => Some(Self::Excused),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Participation {
    Full,
    Partial,
    None,
}

impl Participation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Partial => "partial",
            Self::None => "none",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "full" | "sim" => Some(Self::Full),
            "partial" | "parcial" => Some(Self::Partial),
            "none" | "não" | "nao" => Some(Self::None),
            _ => None,
        }
    }
}

/// Qualitative rating a teacher attaches to a score record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Standing {
    Excellent,
    Good,
    NeedsImprovement,
    Unsatisfactory,
}

impl Standing {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::NeedsImprovement => "needs_improvement",
            Self::Unsatisfactory => "unsatisfactory",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "excellent" | "excelente" => Some(Self::Excellent),
            "good" | "bom" => Some(Self::Good),
            "needs_improvement" | "reforço" | "reforco" => Some(Self::NeedsImprovement),
            "unsatisfactory" | "insatisfatório" | "insatisfatorio" => Some(Self::Unsatisfactory),
            _ => None,
        }
    }

    /// Dashboard bucket for a 0-100 performance figure.
    pub fn from_performance(p: f64) -> Self {
        if p >= 80.0 {
            Self::Excellent
        } else if p >= 60.0 {
            Self::Good
        } else if p >= 40.0 {
            Self::NeedsImprovement
        } else {
            Self::Unsatisfactory
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Activity,
    Exam,
    Seminar,
    Project,
    NotebookCheck,
    Participation,
}

impl ActivityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Activity => "activity",
            Self::Exam => "exam",
            Self::Seminar => "seminar",
            Self::Project => "project",
            Self::NotebookCheck => "notebook_check",
            Self::Participation => "participation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "activity" | "atividade" => Some(Self::Activity),
            "exam" | "prova" => Some(Self::Exam),
            "seminar" | "seminario" | "seminário" => Some(Self::Seminar),
            "project" | "trabalho" => Some(Self::Project),
            "notebook_check" | "visto" => Some(Self::NotebookCheck),
            "participation" | "participacao" | "participação" => Some(Self::Participation),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Planned,
    Taught,
    Cancelled,
}

impl PlanStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Planned => "planned",
            Self::Taught => "taught",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "planned" | "planejado" => Some(Self::Planned),
            "taught" | "concluido" | "concluído" => Some(Self::Taught),
            "cancelled" | "cancelado" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_or_missing_period_falls_back_to_first() {
        assert_eq!(GradingPeriod::from_label_or_first(None), GradingPeriod::First);
        assert_eq!(
            GradingPeriod::from_label_or_first(Some("Geral")),
            GradingPeriod::First
        );
        assert_eq!(
            GradingPeriod::from_label_or_first(Some(" Exame Final ")),
            GradingPeriod::FinalExam
        );
    }

    #[test]
    fn period_serializes_as_label() {
        let v = serde_json::to_value(GradingPeriod::Remediation).expect("serialize");
        assert_eq!(v, serde_json::json!("Recuperação"));
    }

    #[test]
    fn performance_bucket_bounds_are_inclusive() {
        assert_eq!(Standing::from_performance(80.0), Standing::Excellent);
        assert_eq!(Standing::from_performance(79.9), Standing::Good);
        assert_eq!(Standing::from_performance(60.0), Standing::Good);
        assert_eq!(Standing::from_performance(40.0), Standing::NeedsImprovement);
        assert_eq!(Standing::from_performance(39.99), Standing::Unsatisfactory);
    }

    #[test]
    fn legacy_status_labels_parse() {
        assert_eq!(AttendanceStatus::parse("Presente"), Some(AttendanceStatus::Present));
        assert_eq!(AttendanceStatus::parse("Justificado"), Some(AttendanceStatus::Excused));
        assert_eq!(AttendanceStatus::parse("late"), None);
    }
}
