//! Guest list validation.
//!
//! Every row is checked independently and every problem is reported, so a
//! caller can fix specific rows instead of retyping the whole list. Row
//! problems send a submission to preview; whole-submission problems (row
//! count, adult/minor ratio) block it.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::*;
use crate::model::Guest;

const DOB_FORMAT: &str = "%d.%m.%Y";

/// One submitted row, as typed by a user or produced by the spreadsheet
/// importer. `errors` carries problems the importer already found.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestRow {
    pub name: String,
    pub date_of_birth: String,
    pub city: String,
    pub phone: String,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl GuestRow {
    pub fn new(name: &str, date_of_birth: &str, city: &str, phone: &str) -> Self {
        Self {
            name: name.into(),
            date_of_birth: date_of_birth.into(),
            city: city.into(),
            phone: phone.into(),
            errors: Vec::new(),
        }
    }
}

/// A row after validation: trimmed fields, the normalized phone where
/// normalization succeeded, the computed age, and every error found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowPreview {
    pub name: String,
    pub date_of_birth: String,
    pub city: String,
    pub phone: String,
    pub age: Option<u32>,
    pub errors: Vec<String>,
}

impl RowPreview {
    /// Back to an editable row, keeping nothing from the previous pass.
    pub fn to_row(&self) -> GuestRow {
        GuestRow::new(&self.name, &self.date_of_birth, &self.city, &self.phone)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub rows: Vec<RowPreview>,
    pub general_errors: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.general_errors.is_empty() && !self.has_row_errors()
    }

    pub fn has_row_errors(&self) -> bool {
        self.rows.iter().any(|r| !r.errors.is_empty())
    }

    pub fn row_error_count(&self) -> usize {
        self.rows.iter().map(|r| r.errors.len()).sum()
    }

    /// A fully valid report becomes an attachable roster.
    pub fn into_roster(self) -> Result<ValidatedRoster, ValidationReport> {
        if !self.is_valid() {
            return Err(self);
        }
        // Valid rows carry a normalized date and a resolved age.
        let resolved: Option<Vec<(NaiveDate, u32)>> = self
            .rows
            .iter()
            .map(|row| {
                let dob = NaiveDate::parse_from_str(&row.date_of_birth, DOB_FORMAT).ok()?;
                Some((dob, row.age?))
            })
            .collect();
        let Some(resolved) = resolved else {
            return Err(self);
        };
        let guests = self
            .rows
            .into_iter()
            .zip(resolved)
            .map(|(row, (date_of_birth, age))| Guest {
                id: Ulid::new(),
                name: row.name,
                date_of_birth,
                age,
                city: row.city,
                phone: row.phone,
            })
            .collect();
        Ok(ValidatedRoster { guests })
    }
}

/// Guests that passed every check. Only `validate` can produce one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedRoster {
    guests: Vec<Guest>,
}

impl ValidatedRoster {
    pub fn len(&self) -> usize {
        self.guests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guests.is_empty()
    }

    pub fn guests(&self) -> &[Guest] {
        &self.guests
    }

    pub fn into_guests(self) -> Vec<Guest> {
        self.guests
    }
}

/// Coerce a domestic phone number to `8XXXXXXXXXX`.
///
/// Separators are dropped; `+7…` and `7…` become `8…`; a bare ten-digit
/// mobile number starting with `9` gets the trunk prefix.
pub fn normalize_phone(raw: &str) -> Result<String, String> {
    let mut s: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '+')
        .collect();

    if let Some(rest) = s.strip_prefix("+7") {
        s = format!("8{rest}");
    }
    if s.starts_with('7') && s.len() >= 10 {
        s = format!("8{}", &s[1..]);
    }
    if s.starts_with('9') && s.len() == 10 {
        s = format!("8{s}");
    }

    if s.len() == 11 && s.starts_with('8') && s.bytes().all(|b| b.is_ascii_digit()) {
        Ok(s)
    } else {
        Err(format!("invalid phone number '{}'", raw.trim()))
    }
}

/// Parse a `DD.MM.YYYY` date of birth that names a real calendar day with a
/// year between 1900 and next year. Day and month take one or two digits,
/// the year exactly four.
pub fn parse_date_of_birth(s: &str, today: NaiveDate) -> Result<NaiveDate, String> {
    let bad = || format!("invalid date '{s}', expected DD.MM.YYYY");
    let parts: Vec<&str> = s.trim().split('.').collect();
    let &[day, month, year] = parts.as_slice() else {
        return Err(bad());
    };
    let digits = |p: &str, widths: std::ops::RangeInclusive<usize>| {
        widths.contains(&p.len()) && p.bytes().all(|b| b.is_ascii_digit())
    };
    if !digits(day, 1..=2) || !digits(month, 1..=2) || !digits(year, 4..=4) {
        return Err(bad());
    }
    let day: u32 = day.parse().map_err(|_| bad())?;
    let month: u32 = month.parse().map_err(|_| bad())?;
    let year: i32 = year.parse().map_err(|_| bad())?;
    if year < MIN_BIRTH_YEAR || year > today.year() + 1 {
        return Err(bad());
    }
    NaiveDate::from_ymd_opt(year, month, day).ok_or_else(bad)
}

/// Whole years between `date_of_birth` and `today`, comparing month and day
/// exactly.
pub fn age_on(date_of_birth: NaiveDate, today: NaiveDate) -> u32 {
    let mut years = today.year() - date_of_birth.year();
    if (today.month(), today.day()) < (date_of_birth.month(), date_of_birth.day()) {
        years -= 1;
    }
    years.max(0) as u32
}

fn check_row(row: &GuestRow, today: NaiveDate) -> RowPreview {
    let mut errors = row.errors.clone();
    let name = row.name.trim().to_string();
    let mut date_of_birth = row.date_of_birth.trim().to_string();
    let city = row.city.trim().to_string();
    let raw_phone = row.phone.trim().to_string();

    if name.is_empty() {
        errors.push("name is required".into());
    } else if name.len() > MAX_NAME_LEN {
        errors.push("name is too long".into());
    }
    if date_of_birth.is_empty() {
        errors.push("date of birth is required".into());
    }
    if city.is_empty() {
        errors.push("city is required".into());
    }
    if raw_phone.is_empty() {
        errors.push("phone number is required".into());
    }

    let mut age = None;
    if !date_of_birth.is_empty() {
        match parse_date_of_birth(&date_of_birth, today) {
            Ok(dob) => {
                date_of_birth = dob.format(DOB_FORMAT).to_string();
                let years = age_on(dob, today);
                age = Some(years);
                if years < MIN_GUEST_AGE {
                    errors.push(format!(
                        "guest must be at least {MIN_GUEST_AGE} years old, is {years}"
                    ));
                }
            }
            Err(e) => errors.push(e),
        }
    }

    let mut phone = raw_phone.clone();
    if !raw_phone.is_empty() {
        match normalize_phone(&raw_phone) {
            Ok(normalized) => phone = normalized,
            Err(e) => errors.push(e),
        }
    }

    RowPreview {
        name,
        date_of_birth,
        city,
        phone,
        age,
        errors,
    }
}

/// Check a submission against a booking of `party_size` guests.
pub fn validate(party_size: u32, rows: &[GuestRow], today: NaiveDate) -> ValidationReport {
    let previews: Vec<RowPreview> = rows.iter().map(|row| check_row(row, today)).collect();

    let mut general_errors = Vec::new();
    if previews.len() != party_size as usize {
        general_errors.push(format!(
            "guest count ({}) must match the booking party size ({party_size})",
            previews.len()
        ));
    }

    let ages: Vec<u32> = previews.iter().filter_map(|p| p.age).collect();
    let adults = ages.iter().filter(|&&a| a >= ADULT_AGE).count();
    let minors = ages.len() - adults;
    if adults < minors {
        general_errors.push(format!(
            "adults must be at least as many as minors ({adults} < {minors})"
        ));
    }

    ValidationReport {
        rows: previews,
        general_errors,
    }
}
