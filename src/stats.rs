use rusqlite::{params_from_iter, types::Value, Connection};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Grade-point bands used whenever a grade is written without an
/// explicit grade point.
pub fn grade_point_for(score: f64) -> f64 {
    if score >= 90.0 {
        4.0
    } else if score >= 85.0 {
        3.7
    } else if score >= 80.0 {
        3.3
    } else if score >= 75.0 {
        3.0
    } else if score >= 70.0 {
        2.7
    } else if score >= 65.0 {
        2.3
    } else if score >= 60.0 {
        2.0
    } else {
        0.0
    }
}

pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

pub const PASS_SCORE: f64 = 60.0;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatFilters {
    pub student_id: Option<String>,
    pub course_id: Option<String>,
    pub semester: Option<String>,
    pub class_name: Option<String>,
}

/// One filtered grade row with its joined student/course context.
#[derive(Debug, Clone)]
pub struct GradeRecord {
    pub student_id: String,
    pub course_id: String,
    pub course_name: String,
    pub class_name: Option<String>,
    pub semester: String,
    pub score: f64,
    pub grade_point: f64,
    pub credit: f64,
}

pub fn fetch_grade_records(
    conn: &Connection,
    filters: &StatFilters,
) -> Result<Vec<GradeRecord>, rusqlite::Error> {
    let mut sql = String::from(
        "SELECT g.student_id, g.course_id,
                COALESCE(c.course_name, g.course_id),
                s.class_name, g.semester, g.score, g.grade_point,
                COALESCE(c.credit, 0)
         FROM grades g
         LEFT JOIN students s ON s.student_id = g.student_id
         LEFT JOIN courses c ON c.course_id = g.course_id",
    );
    let mut clauses: Vec<&str> = Vec::new();
    let mut params: Vec<Value> = Vec::new();
    if let Some(v) = &filters.student_id {
        clauses.push("g.student_id = ?");
        params.push(Value::Text(v.clone()));
    }
    if let Some(v) = &filters.course_id {
        clauses.push("g.course_id = ?");
        params.push(Value::Text(v.clone()));
    }
    if let Some(v) = &filters.semester {
        clauses.push("g.semester = ?");
        params.push(Value::Text(v.clone()));
    }
    if let Some(v) = &filters.class_name {
        clauses.push("s.class_name = ?");
        params.push(Value::Text(v.clone()));
    }
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY g.semester, g.student_id, g.course_id");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(params), |r| {
        Ok(GradeRecord {
            student_id: r.get(0)?,
            course_id: r.get(1)?,
            course_name: r.get(2)?,
            class_name: r.get(3)?,
            semester: r.get(4)?,
            score: r.get(5)?,
            grade_point: r.get(6)?,
            credit: r.get(7)?,
        })
    })?;
    rows.collect()
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScoreBands {
    pub excellent: i64,
    pub good: i64,
    pub medium: i64,
    pub pass: i64,
    pub fail: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SemesterStat {
    pub semester: String,
    pub count: i64,
    pub avg_score: f64,
    pub pass_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseStat {
    pub course_id: String,
    pub course_name: String,
    pub count: i64,
    pub avg_score: f64,
    pub pass_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassStat {
    pub class_name: String,
    pub count: i64,
    pub avg_score: f64,
    pub pass_rate: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeStatistics {
    pub total_count: i64,
    pub total_students: i64,
    pub average_score: f64,
    pub highest_score: f64,
    pub lowest_score: f64,
    pub average_grade_point: f64,
    pub pass_rate: f64,
    pub fail_rate: f64,
    pub excellent_rate: f64,
    pub score_bands: ScoreBands,
    pub per_semester: Vec<SemesterStat>,
    pub per_course: Vec<CourseStat>,
    pub per_class: Vec<ClassStat>,
}

struct GroupTotals {
    count: i64,
    score_sum: f64,
    passed: i64,
}

impl GroupTotals {
    fn new() -> Self {
        GroupTotals {
            count: 0,
            score_sum: 0.0,
            passed: 0,
        }
    }

    fn push(&mut self, score: f64) {
        self.count += 1;
        self.score_sum += score;
        if score >= PASS_SCORE {
            self.passed += 1;
        }
    }

    fn avg(&self) -> f64 {
        if self.count > 0 {
            round2(self.score_sum / self.count as f64)
        } else {
            0.0
        }
    }

    fn pass_rate(&self) -> f64 {
        if self.count > 0 {
            round2(100.0 * self.passed as f64 / self.count as f64)
        } else {
            0.0
        }
    }
}

/// Aggregate a filtered grade set. An empty set yields all-zero
/// statistics rather than an error.
pub fn aggregate(records: &[GradeRecord]) -> GradeStatistics {
    if records.is_empty() {
        return GradeStatistics::default();
    }

    let total_count = records.len() as i64;
    let mut students: HashSet<&str> = HashSet::new();
    let mut bands = ScoreBands::default();
    let mut score_sum = 0.0;
    let mut point_sum = 0.0;
    let mut highest = f64::MIN;
    let mut lowest = f64::MAX;
    let mut passed: i64 = 0;

    let mut by_semester: BTreeMap<String, GroupTotals> = BTreeMap::new();
    let mut by_course: HashMap<String, (String, GroupTotals)> = HashMap::new();
    let mut by_class: HashMap<String, GroupTotals> = HashMap::new();

    for rec in records {
        students.insert(rec.student_id.as_str());
        score_sum += rec.score;
        point_sum += rec.grade_point;
        highest = highest.max(rec.score);
        lowest = lowest.min(rec.score);
        if rec.score >= PASS_SCORE {
            passed += 1;
        }

        if rec.score >= 90.0 {
            bands.excellent += 1;
        } else if rec.score >= 80.0 {
            bands.good += 1;
        } else if rec.score >= 70.0 {
            bands.medium += 1;
        } else if rec.score >= 60.0 {
            bands.pass += 1;
        } else {
            bands.fail += 1;
        }

        by_semester
            .entry(rec.semester.clone())
            .or_insert_with(GroupTotals::new)
            .push(rec.score);
        by_course
            .entry(rec.course_id.clone())
            .or_insert_with(|| (rec.course_name.clone(), GroupTotals::new()))
            .1
            .push(rec.score);
        if let Some(class_name) = rec.class_name.as_deref() {
            if !class_name.is_empty() {
                by_class
                    .entry(class_name.to_string())
                    .or_insert_with(GroupTotals::new)
                    .push(rec.score);
            }
        }
    }

    let n = total_count as f64;
    let pass_rate = round2(100.0 * passed as f64 / n);
    let excellent_rate = round2(100.0 * bands.excellent as f64 / n);

    let per_semester = by_semester
        .into_iter()
        .map(|(semester, totals)| SemesterStat {
            semester,
            count: totals.count,
            avg_score: totals.avg(),
            pass_rate: totals.pass_rate(),
        })
        .collect();

    let mut per_course: Vec<CourseStat> = by_course
        .into_iter()
        .map(|(course_id, (course_name, totals))| CourseStat {
            course_id,
            course_name,
            count: totals.count,
            avg_score: totals.avg(),
            pass_rate: totals.pass_rate(),
        })
        .collect();
    per_course.sort_by(|a, b| {
        b.avg_score
            .partial_cmp(&a.avg_score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.course_id.cmp(&b.course_id))
    });

    let mut per_class: Vec<ClassStat> = by_class
        .into_iter()
        .map(|(class_name, totals)| ClassStat {
            class_name,
            count: totals.count,
            avg_score: totals.avg(),
            pass_rate: totals.pass_rate(),
        })
        .collect();
    per_class.sort_by(|a, b| {
        b.avg_score
            .partial_cmp(&a.avg_score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.class_name.cmp(&b.class_name))
    });

    GradeStatistics {
        total_count,
        total_students: students.len() as i64,
        average_score: round2(score_sum / n),
        highest_score: highest,
        lowest_score: lowest,
        average_grade_point: round2(point_sum / n),
        pass_rate,
        fail_rate: round2(100.0 - pass_rate),
        excellent_rate,
        score_bands: bands,
        per_semester,
        per_course,
        per_class,
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GpaSummary {
    pub student_id: String,
    pub semester: Option<String>,
    pub total_credit: f64,
    pub average_score: f64,
    /// Credit-weighted mean score, alongside the plain mean.
    pub weighted_average: f64,
    pub gpa: f64,
}

/// GPA over an already-filtered record set:
/// `sum(grade_point * credit) / sum(credit)`, zeros when no credit.
pub fn student_gpa(student_id: &str, semester: Option<&str>, records: &[GradeRecord]) -> GpaSummary {
    let mut total_credit = 0.0;
    let mut weighted_points = 0.0;
    let mut weighted_scores = 0.0;
    let mut score_sum = 0.0;

    for rec in records {
        total_credit += rec.credit;
        weighted_points += rec.grade_point * rec.credit;
        weighted_scores += rec.score * rec.credit;
        score_sum += rec.score;
    }

    let (gpa, weighted_average) = if total_credit > 0.0 {
        (
            round2(weighted_points / total_credit),
            round2(weighted_scores / total_credit),
        )
    } else {
        (0.0, 0.0)
    };
    let average_score = if records.is_empty() {
        0.0
    } else {
        round2(score_sum / records.len() as f64)
    };

    GpaSummary {
        student_id: student_id.to_string(),
        semester: semester.map(|s| s.to_string()),
        total_credit: round2(total_credit),
        average_score,
        weighted_average,
        gpa,
    }
}
