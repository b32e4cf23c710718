//! Parser for the REDCap Data Entry Trigger payload.
//!
//! REDCap posts an `application/x-www-form-urlencoded` body whenever a form is
//! saved:
//!
//! ```text
//! redcap_url=https%3A%2F%2Fredcap.example.org%2Fredcap%2F&project_url=...&project_id=12
//!     &username=bob&record=5&instrument=enrolment&enrolment_complete=2
//!     &redcap_event_name=enrolment_arm_1
//! ```
//!
//! Every token is classified against a fixed table of parameter names. A token
//! that is not in the table is accepted only when its name is
//! `<instrument>_complete`, which means the `instrument` token must come before
//! the status token. Anything else fails the whole payload.
//!
//! When `project_url` is present, the REDCap base URL is derived from it by
//! cutting at `index.php?` and takes precedence over `redcap_url`, wherever
//! the two tokens appear.

use std::str::FromStr;
use thiserror::Error;
use url::Url;
use url::form_urlencoded;

const STATUS_SUFFIX: &str = "_complete";
const PROJECT_URL_QUERY_MARKER: &str = "index.php?";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TriggerError {
    #[error("token is not a name=value pair: {0}")]
    MalformedToken(String),

    #[error("unknown trigger parameter: {0}")]
    UnknownParameter(String),

    #[error("status parameter {0} appears before the instrument parameter")]
    StatusBeforeInstrument(String),

    #[error("{name} is not a valid number: {value}")]
    InvalidNumber { name: &'static str, value: String },

    #[error("{value} is not a valid instrument status")]
    InvalidStatus { value: String },

    #[error("{name} is not a valid URL: {value}")]
    InvalidUrl { name: &'static str, value: String },

    #[error("project URL has no index.php? marker: {0}")]
    MissingQueryMarker(String),
}

/// Completion state of a REDCap instrument
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InstrumentStatus {
    Incomplete,
    Unverified,
    Complete,
}

impl InstrumentStatus {
    pub const fn code(&self) -> u8 {
        match self {
            InstrumentStatus::Incomplete => 0,
            InstrumentStatus::Unverified => 1,
            InstrumentStatus::Complete => 2,
        }
    }
}

impl TryFrom<i64> for InstrumentStatus {
    type Error = i64;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(InstrumentStatus::Incomplete),
            1 => Ok(InstrumentStatus::Unverified),
            2 => Ok(InstrumentStatus::Complete),
            other => Err(other),
        }
    }
}

/// Name of the field holding the completion status of `instrument`.
pub fn status_field(instrument: &str) -> String {
    format!("{instrument}{STATUS_SUFFIX}")
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Parameter {
    ProjectId,
    Username,
    Instrument,
    Record,
    EventName,
    DataAccessGroup,
    RedcapUrl,
    ProjectUrl,
    InstrumentStatus,
}

const PARAMETERS: &[(&str, Parameter)] = &[
    ("project_id", Parameter::ProjectId),
    ("username", Parameter::Username),
    ("instrument", Parameter::Instrument),
    ("record", Parameter::Record),
    ("redcap_event_name", Parameter::EventName),
    ("redcap_data_access_group", Parameter::DataAccessGroup),
    ("redcap_url", Parameter::RedcapUrl),
    ("project_url", Parameter::ProjectUrl),
];

fn classify(name: &str, instrument: Option<&str>) -> Result<Parameter, TriggerError> {
    if let Some((_, parameter)) = PARAMETERS.iter().find(|(known, _)| *known == name) {
        return Ok(*parameter);
    }

    match instrument {
        Some(instrument) if name == status_field(instrument) => Ok(Parameter::InstrumentStatus),
        None if name.ends_with(STATUS_SUFFIX) => {
            Err(TriggerError::StatusBeforeInstrument(name.to_string()))
        }
        _ => Err(TriggerError::UnknownParameter(name.to_string())),
    }
}

/// A parsed Data Entry Trigger
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Trigger {
    pub project_id: Option<u32>,
    pub username: Option<String>,
    pub instrument: Option<String>,
    pub record: Option<u32>,
    pub event_name: Option<String>,
    pub data_access_group: Option<String>,
    pub instrument_status: Option<InstrumentStatus>,
    /// Base URL of the REDCap instance that fired the trigger
    pub source_url: Option<Url>,
    pub project_url: Option<Url>,
}

impl Trigger {
    pub fn parse(raw: &str) -> Result<Self, TriggerError> {
        let mut trigger = Trigger::default();
        let mut project_base_url = None;

        for token in raw.trim().split('&').filter(|token| !token.is_empty()) {
            if !token.contains('=') {
                return Err(TriggerError::MalformedToken(token.to_string()));
            }
            let Some((name, value)) = form_urlencoded::parse(token.as_bytes()).next() else {
                return Err(TriggerError::MalformedToken(token.to_string()));
            };
            let name = name.trim();
            let value = value.trim();

            match classify(name, trigger.instrument.as_deref())? {
                Parameter::ProjectId => {
                    trigger.project_id = Some(parse_number("project_id", value)?);
                }
                Parameter::Username => trigger.username = Some(value.to_string()),
                Parameter::Instrument => trigger.instrument = Some(value.to_string()),
                Parameter::Record => trigger.record = Some(parse_number("record", value)?),
                Parameter::EventName => trigger.event_name = Some(value.to_string()),
                Parameter::DataAccessGroup => {
                    trigger.data_access_group = Some(value.to_string());
                }
                Parameter::RedcapUrl => {
                    trigger.source_url = Some(parse_url("redcap_url", value)?);
                }
                Parameter::ProjectUrl => {
                    let project_url = parse_url("project_url", value)?;
                    project_base_url = Some(base_url_of(&project_url)?);
                    trigger.project_url = Some(project_url);
                }
                Parameter::InstrumentStatus => {
                    trigger.instrument_status = Some(parse_status(value)?);
                }
            }
        }

        if project_base_url.is_some() {
            trigger.source_url = project_base_url;
        }

        Ok(trigger)
    }

    /// Lowercased host of the REDCap instance that fired the trigger.
    pub fn source_host(&self) -> Option<String> {
        self.source_url
            .as_ref()
            .and_then(|url| url.host_str())
            .map(str::to_ascii_lowercase)
    }

    /// Whether the trigger was fired for `enrolment_event`.
    pub fn is_event(&self, enrolment_event: &str) -> bool {
        self.event_name
            .as_deref()
            .is_some_and(|event| event.eq_ignore_ascii_case(enrolment_event))
    }
}

impl FromStr for Trigger {
    type Err = TriggerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Trigger::parse(s)
    }
}

fn parse_number(name: &'static str, value: &str) -> Result<u32, TriggerError> {
    value.parse().map_err(|_| TriggerError::InvalidNumber {
        name,
        value: value.to_string(),
    })
}

fn parse_url(name: &'static str, value: &str) -> Result<Url, TriggerError> {
    Url::parse(value).map_err(|_| TriggerError::InvalidUrl {
        name,
        value: value.to_string(),
    })
}

fn parse_status(value: &str) -> Result<InstrumentStatus, TriggerError> {
    let invalid = || TriggerError::InvalidStatus {
        value: value.to_string(),
    };
    let code: i64 = value.parse().map_err(|_| invalid())?;
    InstrumentStatus::try_from(code).map_err(|_| invalid())
}

fn base_url_of(project_url: &Url) -> Result<Url, TriggerError> {
    let full = project_url.as_str();
    let end = full
        .find(PROJECT_URL_QUERY_MARKER)
        .ok_or_else(|| TriggerError::MissingQueryMarker(full.to_string()))?;
    parse_url("project_url", &full[..end])
}
