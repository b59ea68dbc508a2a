use rusqlite::Connection;
use serde::Serialize;

/// Week parity of a schedule entry: every week, odd weeks only, or
/// even weeks only. Stored as the integer codes 0/1/2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeekType {
    All,
    Odd,
    Even,
}

impl WeekType {
    pub fn from_code(code: i64) -> Option<WeekType> {
        match code {
            0 => Some(WeekType::All),
            1 => Some(WeekType::Odd),
            2 => Some(WeekType::Even),
            _ => None,
        }
    }

    pub fn code(self) -> i64 {
        match self {
            WeekType::All => 0,
            WeekType::Odd => 1,
            WeekType::Even => 2,
        }
    }
}

/// "all" clashes with everything; odd and even only clash with "all"
/// and themselves. An odd-week and an even-week course can legally
/// share a room and slot.
pub fn parity_compatible(a: WeekType, b: WeekType) -> bool {
    match (a, b) {
        (WeekType::All, _) | (_, WeekType::All) => true,
        (WeekType::Odd, WeekType::Odd) | (WeekType::Even, WeekType::Even) => true,
        _ => false,
    }
}

/// Closed-interval overlap: sections [1,2] and [2,3] do overlap.
pub fn sections_overlap(a_start: i64, a_end: i64, b_start: i64, b_end: i64) -> bool {
    !(a_end < b_start || a_start > b_end)
}

pub fn weeks_overlap(a_start: i64, a_end: i64, b_start: i64, b_end: i64) -> bool {
    !(a_end < b_start || a_start > b_end)
}

/// Whether an entry occupies the given week number of its semester.
pub fn occurs_in_week(week_type: WeekType, start_week: i64, end_week: i64, week: i64) -> bool {
    if week < start_week || week > end_week {
        return false;
    }
    match week_type {
        WeekType::All => true,
        WeekType::Odd => week % 2 == 1,
        WeekType::Even => week % 2 == 0,
    }
}

/// The candidate slot being inserted or (after merging a patch) updated.
#[derive(Debug, Clone)]
pub struct Slot {
    pub semester: String,
    pub day_of_week: i64,
    pub start_section: i64,
    pub end_section: i64,
    pub start_week: i64,
    pub end_week: i64,
    pub week_type: WeekType,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictEntry {
    pub id: String,
    pub course_id: String,
    pub course_name: String,
    pub location: String,
    pub day_of_week: i64,
    pub start_section: i64,
    pub end_section: i64,
    pub start_week: i64,
    pub end_week: i64,
    pub week_type: i64,
}

/// Candidates share the semester and weekday (SQL narrows); the three
/// overlap tests run here. A true conflict needs section overlap AND
/// week-range overlap AND compatible parity.
pub fn find_conflicts(
    conn: &Connection,
    slot: &Slot,
    exclude_id: Option<&str>,
) -> Result<Vec<ConflictEntry>, rusqlite::Error> {
    let mut sql = String::from(
        "SELECT s.id, s.course_id, COALESCE(c.course_name, s.course_id), s.location,
                s.day_of_week, s.start_section, s.end_section,
                s.start_week, s.end_week, s.week_type
         FROM schedules s
         LEFT JOIN courses c ON c.course_id = s.course_id
         WHERE s.semester = ? AND s.day_of_week = ?",
    );
    if exclude_id.is_some() {
        sql.push_str(" AND s.id != ?");
    }
    sql.push_str(" ORDER BY s.start_section");

    let mut stmt = conn.prepare(&sql)?;
    let map_row = |r: &rusqlite::Row<'_>| {
        Ok(ConflictEntry {
            id: r.get(0)?,
            course_id: r.get(1)?,
            course_name: r.get(2)?,
            location: r.get(3)?,
            day_of_week: r.get(4)?,
            start_section: r.get(5)?,
            end_section: r.get(6)?,
            start_week: r.get(7)?,
            end_week: r.get(8)?,
            week_type: r.get(9)?,
        })
    };
    let rows: Vec<ConflictEntry> = match exclude_id {
        Some(id) => stmt
            .query_map((&slot.semester, slot.day_of_week, id), map_row)?
            .collect::<Result<_, _>>()?,
        None => stmt
            .query_map((&slot.semester, slot.day_of_week), map_row)?
            .collect::<Result<_, _>>()?,
    };

    Ok(rows
        .into_iter()
        .filter(|e| {
            let parity = WeekType::from_code(e.week_type).unwrap_or(WeekType::All);
            sections_overlap(
                e.start_section,
                e.end_section,
                slot.start_section,
                slot.end_section,
            ) && weeks_overlap(e.start_week, e.end_week, slot.start_week, slot.end_week)
                && parity_compatible(parity, slot.week_type)
        })
        .collect())
}
