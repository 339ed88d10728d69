use serde::Serialize;

/// School weekdays. Stored as their English names in timetable rows;
/// Saturday/Sunday never carry lessons and have no variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Weekday {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
}

impl Weekday {
    pub const ALL: [Weekday; 5] = [
        Weekday::Monday,
        Weekday::Tuesday,
        Weekday::Wednesday,
        Weekday::Thursday,
        Weekday::Friday,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Weekday::Monday => "Monday",
            Weekday::Tuesday => "Tuesday",
            Weekday::Wednesday => "Wednesday",
            Weekday::Thursday => "Thursday",
            Weekday::Friday => "Friday",
        }
    }

    pub fn parse(s: &str) -> Option<Weekday> {
        match s.trim() {
            "Monday" => Some(Weekday::Monday),
            "Tuesday" => Some(Weekday::Tuesday),
            "Wednesday" => Some(Weekday::Wednesday),
            "Thursday" => Some(Weekday::Thursday),
            "Friday" => Some(Weekday::Friday),
            _ => None,
        }
    }

    /// None for Saturday/Sunday.
    pub fn from_date(date: chrono::NaiveDate) -> Option<Weekday> {
        use chrono::Datelike;
        match date.weekday() {
            chrono::Weekday::Mon => Some(Weekday::Monday),
            chrono::Weekday::Tue => Some(Weekday::Tuesday),
            chrono::Weekday::Wed => Some(Weekday::Wednesday),
            chrono::Weekday::Thu => Some(Weekday::Thursday),
            chrono::Weekday::Fri => Some(Weekday::Friday),
            chrono::Weekday::Sat | chrono::Weekday::Sun => None,
        }
    }
}

/// One marker of the school-day raster: a numbered lesson period or a break.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum PatternSlot {
    Period { period: i64 },
    Break { minutes: i64 },
}

/// The ordered period/break sequence of a school day. One pattern is shared
/// by all weekdays.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulePattern {
    pub slots: Vec<PatternSlot>,
}

impl SchedulePattern {
    /// Period numbers in raster order. Note the gap: period 7 does not
    /// exist, period 8 directly follows the midday break after period 6.
    pub fn periods(&self) -> Vec<i64> {
        self.slots
            .iter()
            .filter_map(|s| match s {
                PatternSlot::Period { period } => Some(*period),
                PatternSlot::Break { .. } => None,
            })
            .collect()
    }
}

impl Default for SchedulePattern {
    fn default() -> Self {
        SchedulePattern {
            slots: vec![
                PatternSlot::Period { period: 1 },
                PatternSlot::Period { period: 2 },
                PatternSlot::Break { minutes: 25 },
                PatternSlot::Period { period: 3 },
                PatternSlot::Period { period: 4 },
                PatternSlot::Break { minutes: 20 },
                PatternSlot::Period { period: 5 },
                PatternSlot::Period { period: 6 },
                PatternSlot::Break { minutes: 45 },
                PatternSlot::Period { period: 8 },
                PatternSlot::Period { period: 9 },
            ],
        }
    }
}
