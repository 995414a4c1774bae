//! Path-template expansion
//!
//! Remote paths, directory-naming expressions, and external-operation command
//! lines may carry `<...>` tokens that expand against the current date and
//! the identifiers of the device, profile, and task being processed.
//!
//! Expansion is a flat literal-substitution pass: a pure function of
//! (expression, now, identifiers). Running it twice within the same minute
//! yields identical output. The `<Day DD-1>` token is detected *before* any
//! substitution happens, so its one-day shift applies uniformly to every date
//! token in the same expression.

use chrono::{DateTime, Datelike, Duration, Local};
use std::path::{Path, PathBuf};

use crate::types::Device;

/// Identifiers available to template expansion.
pub struct TemplateContext<'a> {
    /// Wall-clock time the expansion is anchored to
    pub now: DateTime<Local>,
    /// Device being processed
    pub device: &'a Device,
    /// Name of the connection profile
    pub profile_name: &'a str,
    /// Identity of the task
    pub task_id: i64,
    /// The device's resolved local folder path
    pub device_folder_path: &'a Path,
}

/// Expand every template token in `expression`.
///
/// Tokens with no defined expansion are left in place.
pub fn expand(expression: &str, ctx: &TemplateContext<'_>) -> String {
    // The shift trigger must be found before any date token is rewritten.
    let date = if expression.contains("<Day DD-1>") {
        ctx.now.date_naive() - Duration::days(1)
    } else {
        ctx.now.date_naive()
    };

    let mut out = expression.to_string();

    out = out.replace("<Day DD-1>", &format!("Day {:02}", date.day()));
    out = out.replace("<Day DD>", &format!("Day {:02}", date.day()));
    out = out.replace("<Month MM>", &format!("Month {:02}", date.month()));
    out = out.replace("<YYYY>", &format!("{:04}", date.year()));
    out = out.replace("<YY>", &format!("{:02}", date.year() % 100));
    out = out.replace("<MM>", &format!("{:02}", date.month()));
    out = out.replace("<DD>", &format!("{:02}", date.day()));

    out = out.replace("<DeviceName>", &ctx.device.name);
    out = out.replace("<DeviceAcronym>", &ctx.device.acronym);
    out = out.replace("<DeviceFolderName>", ctx.device.folder_name());
    out = out.replace("<ProfileName>", ctx.profile_name);
    out = out.replace("<DeviceID>", &ctx.device.id.to_string());
    out = out.replace("<TaskID>", &ctx.task_id.to_string());
    out = out.replace(
        "<DeviceFolderPath>",
        &ctx.device_folder_path.to_string_lossy(),
    );

    out
}

/// Turn an expanded directory expression into a relative [`PathBuf`].
///
/// Directory-naming expressions use `\` separators (the convention of the
/// originating fleet systems); both `\` and `/` are accepted and rebuilt with
/// the platform separator.
pub fn expanded_to_path(expanded: &str) -> PathBuf {
    expanded
        .split(['\\', '/'])
        .filter(|part| !part.is_empty())
        .collect()
}
