use std::future::ready;

use chatloop_core::tool::{Error as ToolError, Tool, ToolResult};
use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use chrono_tz::Tz;
use schemars::{JsonSchema, schema_for};
use serde::Deserialize;
use serde_json::Value;

const TIME_FORMAT: &str = "%A, %Y-%m-%d %H:%M:%S (UTC%:z)";

/// Parameters of [`ClockTool`].
#[derive(Deserialize, JsonSchema)]
pub struct ClockParameters {
    #[schemars(
        description = "IANA time zone like `Asia/Seoul`, or a UTC offset like `+09:00`. Defaults to UTC."
    )]
    #[serde(default, alias = "utc_offset")]
    timezone: Option<String>,
    #[schemars(description = "Place name to label the answer with.")]
    #[serde(default)]
    location: Option<String>,
}

/// A tool for reading the current date and time in a given time zone.
///
/// Zone names are resolved with the tz database, so daylight saving time
/// is applied. Fixed offsets are accepted as well.
pub struct ClockTool {
    parameter_schema: Value,
    now: fn() -> DateTime<Utc>,
}

impl ClockTool {
    /// Creates a new clock tool reading the system clock.
    #[inline]
    pub fn new() -> Self {
        Self::with_clock(Utc::now)
    }

    /// Creates a new clock tool reading time from `now`.
    #[inline]
    pub fn with_clock(now: fn() -> DateTime<Utc>) -> Self {
        ClockTool {
            parameter_schema: schema_for!(ClockParameters).to_value(),
            now,
        }
    }
}

impl Default for ClockTool {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl Tool for ClockTool {
    type Input = ClockParameters;

    fn name(&self) -> &str {
        "current_time"
    }

    fn description(&self) -> &str {
        r#"
Returns the current date, weekday and time.
Pass the time zone of the place you are interested in, e.g. `Asia/Tokyo`."#
    }

    fn parameter_schema(&self) -> &Value {
        &self.parameter_schema
    }

    fn execute(
        &self,
        input: ClockParameters,
    ) -> impl Future<Output = ToolResult> + Send + 'static {
        let now = (self.now)();
        let result = local_time(now, input.timezone.as_deref()).map(|time| {
            match input.location {
                Some(location) => format!("Current time in {location}: {time}"),
                None => format!("Current time: {time}"),
            }
        });
        ready(result)
    }
}

fn local_time(
    now: DateTime<Utc>,
    timezone: Option<&str>,
) -> Result<String, ToolError> {
    let Some(timezone) = timezone.map(str::trim).filter(|tz| !tz.is_empty())
    else {
        return Ok(format_in(now, &Utc));
    };
    if let Ok(tz) = timezone.parse::<Tz>() {
        return Ok(format_in(now, &tz));
    }
    match timezone.parse::<FixedOffset>() {
        Ok(offset) => Ok(format_in(now, &offset)),
        Err(_) => Err(ToolError::invalid_input().with_reason(format!(
            "unknown time zone `{timezone}`, expected something like \
             `Asia/Seoul` or `+09:00`"
        ))),
    }
}

fn format_in<Z: TimeZone>(now: DateTime<Utc>, zone: &Z) -> String
where
    Z::Offset: std::fmt::Display,
{
    now.with_timezone(zone).format(TIME_FORMAT).to_string()
}
