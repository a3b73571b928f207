//! Numeric invariants the core defends even though callers pre-validate shape.

use chrono::{NaiveTime, Timelike};

use crate::limits::*;
use crate::model::Window;

use super::BookingError;

pub fn window(start: NaiveTime, end: NaiveTime) -> Result<Window, BookingError> {
    for t in [start, end] {
        if t.second() != 0 || t.nanosecond() != 0 {
            return Err(BookingError::Validation(format!(
                "time {t} is not a whole minute"
            )));
        }
    }
    let w = Window::from_times(start, end);
    if w.start >= w.end {
        return Err(BookingError::Validation(format!(
            "start {start} must be before end {end}"
        )));
    }
    if !(MIN_DURATION_MINUTES..=MAX_DURATION_MINUTES).contains(&w.duration()) {
        return Err(BookingError::Validation(format!(
            "duration must be between {MIN_DURATION_MINUTES} and {MAX_DURATION_MINUTES} minutes, got {}",
            w.duration()
        )));
    }
    Ok(w)
}

pub fn buffer(minutes: u16) -> Result<u16, BookingError> {
    if minutes > MAX_BUFFER_MINUTES {
        return Err(BookingError::Validation(format!(
            "buffer must be at most {MAX_BUFFER_MINUTES} minutes"
        )));
    }
    Ok(minutes)
}

pub fn party_size(size: u32) -> Result<u32, BookingError> {
    if size == 0 {
        return Err(BookingError::Validation("party size must be positive".into()));
    }
    Ok(size)
}

/// Trim notes; blank notes become `None`.
pub fn notes(notes: Option<String>) -> Result<Option<String>, BookingError> {
    let Some(text) = notes else { return Ok(None) };
    let text = text.trim();
    if text.len() > MAX_NOTES_LEN {
        return Err(BookingError::Validation(format!(
            "notes longer than {MAX_NOTES_LEN} bytes"
        )));
    }
    Ok((!text.is_empty()).then(|| text.to_string()))
}
