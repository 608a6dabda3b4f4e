//! The request row: the canonical entity flowing from submission through
//! approval, allocation, and execution.
//!
//! Rows live in named master tables with a fixed column vocabulary. The
//! storage shape is a column-name → cell-text map (empty string = empty
//! cell); [`RequestRecord`] is the typed view used by the engine.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::approval::{ApprovalLevel, LEVEL_COUNT};

/// Raw row shape shared with the row store: column name → cell text.
pub type RowValues = BTreeMap<String, String>;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestNumber(pub String);

impl RequestNumber {
    /// `<abbr>/MDM/<business unit>/<counter>`; the counter key is everything
    /// before the final slash.
    pub fn format(prefix: &RequestPrefix, counter: i64) -> Self {
        Self(format!("{}/MDM/{}/{:05}", prefix.table_abbreviation, prefix.business_unit, counter))
    }

    pub fn prefix(&self) -> Option<&str> {
        self.0.rsplit_once('/').map(|(prefix, _)| prefix)
    }

    pub fn counter(&self) -> Option<i64> {
        self.0.rsplit_once('/').and_then(|(_, tail)| tail.parse().ok())
    }
}

impl std::fmt::Display for RequestNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key under which request-number counters are reconciled.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestPrefix {
    pub table_abbreviation: String,
    pub business_unit: String,
}

impl RequestPrefix {
    pub fn new(table_abbreviation: impl Into<String>, business_unit: impl Into<String>) -> Self {
        Self {
            table_abbreviation: table_abbreviation.into(),
            business_unit: business_unit.into(),
        }
    }

    pub fn counter_key(&self) -> String {
        format!("{}/MDM/{}", self.table_abbreviation, self.business_unit)
    }
}

/// Opaque handle to the external attachment document of a request.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttachmentRef(pub String);

/// The fixed request-type taxonomy. Each type belongs to exactly one master
/// table and determines where task rows start inside the attachment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestType {
    BomCreate,
    BomModify,
    PricingCreate,
    PricingModify,
    CustomerCreate,
    CustomerModify,
    VendorCreate,
    PromoCreate,
}

impl RequestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BomCreate => "BOM Create",
            Self::BomModify => "BOM Modify",
            Self::PricingCreate => "Pricing Create",
            Self::PricingModify => "Pricing Modify",
            Self::CustomerCreate => "Customer Create",
            Self::CustomerModify => "Customer Modify",
            Self::VendorCreate => "Vendor Create",
            Self::PromoCreate => "Promo Create",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "BOM Create" => Some(Self::BomCreate),
            "BOM Modify" => Some(Self::BomModify),
            "Pricing Create" => Some(Self::PricingCreate),
            "Pricing Modify" => Some(Self::PricingModify),
            "Customer Create" => Some(Self::CustomerCreate),
            "Customer Modify" => Some(Self::CustomerModify),
            "Vendor Create" => Some(Self::VendorCreate),
            "Promo Create" => Some(Self::PromoCreate),
            _ => None,
        }
    }

    pub fn master_table(&self) -> MasterTable {
        match self {
            Self::BomCreate | Self::BomModify => MasterTable::Bom,
            Self::PricingCreate | Self::PricingModify => MasterTable::Pricing,
            Self::CustomerCreate | Self::CustomerModify => MasterTable::Customer,
            Self::VendorCreate => MasterTable::Vendor,
            Self::PromoCreate => MasterTable::Promo,
        }
    }

    /// First task row inside the attachment. Pricing templates carry an
    /// extended header block.
    pub fn task_start_row(&self) -> u32 {
        match self {
            Self::PricingCreate => 34,
            _ => 25,
        }
    }

    pub fn all() -> [Self; 8] {
        [
            Self::BomCreate,
            Self::BomModify,
            Self::PricingCreate,
            Self::PricingModify,
            Self::CustomerCreate,
            Self::CustomerModify,
            Self::VendorCreate,
            Self::PromoCreate,
        ]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MasterTable {
    Bom,
    Pricing,
    Customer,
    Vendor,
    Promo,
}

impl MasterTable {
    pub fn table_name(&self) -> &'static str {
        match self {
            Self::Bom => "BOM",
            Self::Pricing => "PRICING",
            Self::Customer => "CUSTOMER",
            Self::Vendor => "VENDOR",
            Self::Promo => "PROMO",
        }
    }

    pub fn abbreviation(&self) -> &'static str {
        match self {
            Self::Bom => "BOM",
            Self::Pricing => "PRC",
            Self::Customer => "CST",
            Self::Vendor => "VDR",
            Self::Promo => "PRM",
        }
    }

    pub fn all() -> [Self; 5] {
        [Self::Bom, Self::Pricing, Self::Customer, Self::Vendor, Self::Promo]
    }
}

/// Requester-level status (approval level 0).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequesterStatus {
    Completed,
    Expired,
    Invalid,
    NeedReview,
}

impl RequesterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "Completed",
            Self::Expired => "Expired",
            Self::Invalid => "Invalid",
            Self::NeedReview => "Need Review",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "Completed" => Some(Self::Completed),
            "Expired" => Some(Self::Expired),
            "Invalid" => Some(Self::Invalid),
            "Need Review" => Some(Self::NeedReview),
            _ => None,
        }
    }
}

/// Approver-level status (approval levels 1..3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApproverStatus {
    Approved,
    Rejected,
    PartiallyRejected,
    SendBack,
}

impl ApproverStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "Approved",
            Self::Rejected => "Rejected",
            Self::PartiallyRejected => "Partially Rejected",
            Self::SendBack => "Send Back",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "Approved" => Some(Self::Approved),
            "Rejected" => Some(Self::Rejected),
            "Partially Rejected" => Some(Self::PartiallyRejected),
            "Send Back" => Some(Self::SendBack),
            _ => None,
        }
    }
}

/// Execution-phase status on the assignee's table, mirrored to the master.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessStatus {
    OnGoing,
    Completed,
    PartiallyRejected,
    Rejected,
    SendBack,
}

impl ProcessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OnGoing => "On Going",
            Self::Completed => "Completed",
            Self::PartiallyRejected => "Partially Rejected",
            Self::Rejected => "Rejected",
            Self::SendBack => "Send Back",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "On Going" => Some(Self::OnGoing),
            "Completed" => Some(Self::Completed),
            "Partially Rejected" => Some(Self::PartiallyRejected),
            "Rejected" => Some(Self::Rejected),
            "Send Back" => Some(Self::SendBack),
            _ => None,
        }
    }

    /// Completed / Rejected / Partially Rejected close the request; On Going
    /// and Send Back do not.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Rejected | Self::PartiallyRejected)
    }
}

/// Column vocabulary of the master and assignee tables.
pub mod columns {
    pub const REQUEST_NUMBER: &str = "Request Number";
    pub const TIMESTAMP: &str = "Timestamp";
    pub const REQUEST_TYPE: &str = "Request Type";
    pub const DEPARTMENT: &str = "Department";
    pub const COMPANY_CODE: &str = "Company Code";
    pub const COMPANY_NAME: &str = "Company Name";
    pub const EMAIL_ADDRESS: &str = "Email Address";
    pub const ATTACHMENT: &str = "Attachment";
    pub const TOTAL_TASK: &str = "Total Task";
    pub const BASELINE: &str = "Baseline";
    pub const ESTIMATED_TIME: &str = "Estimated Time";
    pub const ESTIMATED_TIME_FINISHED: &str = "Estimated Time Finished";
    pub const PROCESSED_BY: &str = "Processed By";
    pub const PROCESS_STATUS: &str = "Process Status";
    pub const TAKEN_DATE: &str = "Taken Date";
    pub const PROCESSED_DATE: &str = "Processed Date";
    pub const FEEDBACK_STATUS: &str = "Feedback Status";
    pub const NEW_SUBMISSION_STATUS: &str = "New Submission Status";
    pub const SENT_BACK_COUNT: &str = "System Sent Back Count";
    pub const SENT_BACK_EMAIL_STATUS: &str = "System Sent Back Email Status";

    const RESPON: [&str; 4] =
        ["Respon Requester", "Respon Approver", "Respon Approver II", "Respon Approver III"];
    const NAME: [&str; 4] =
        ["Name Requester", "Name Approver", "Name Approver II", "Name Approver III"];
    const STAMP: [&str; 4] = [
        "Timestamp Requester",
        "Timestamp Approver",
        "Timestamp Approver II",
        "Timestamp Approver III",
    ];
    const ASK: [&str; 4] =
        ["", "Ask Approver Status", "Ask Approver II Status", "Ask Approver III Status"];

    pub fn respon(level: usize) -> &'static str {
        RESPON[level]
    }

    pub fn name(level: usize) -> &'static str {
        NAME[level]
    }

    pub fn timestamp(level: usize) -> &'static str {
        STAMP[level]
    }

    /// Empty for level 0: the requester is never asked for approval.
    pub fn ask_status(level: usize) -> &'static str {
        ASK[level]
    }

    /// The send-back clear wipes everything from this anchor to end of row.
    pub const CLEAR_ANCHOR: &str = NEW_SUBMISSION_STATUS;

    /// Canonical column order of a master table. Everything after the
    /// submission anchor belongs to the approval chain, which is what the
    /// send-back range clear relies on.
    pub const MASTER_HEADERS: [&str; 35] = [
        TIMESTAMP,
        REQUEST_TYPE,
        DEPARTMENT,
        COMPANY_CODE,
        COMPANY_NAME,
        EMAIL_ADDRESS,
        REQUEST_NUMBER,
        ATTACHMENT,
        TOTAL_TASK,
        BASELINE,
        ESTIMATED_TIME,
        ESTIMATED_TIME_FINISHED,
        PROCESSED_BY,
        PROCESS_STATUS,
        TAKEN_DATE,
        PROCESSED_DATE,
        FEEDBACK_STATUS,
        SENT_BACK_COUNT,
        SENT_BACK_EMAIL_STATUS,
        NEW_SUBMISSION_STATUS,
        "Respon Requester",
        "Name Requester",
        "Timestamp Requester",
        "Ask Approver Status",
        "Respon Approver",
        "Name Approver",
        "Timestamp Approver",
        "Ask Approver II Status",
        "Respon Approver II",
        "Name Approver II",
        "Timestamp Approver II",
        "Ask Approver III Status",
        "Respon Approver III",
        "Name Approver III",
        "Timestamp Approver III",
    ];
}

fn cell<'a>(row: &'a RowValues, col: &str) -> &'a str {
    row.get(col).map(String::as_str).unwrap_or("").trim()
}

fn parse_cell_timestamp(row: &RowValues, col: &str) -> Option<DateTime<Utc>> {
    let raw = cell(row, col);
    if raw.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(raw).ok().map(|value| value.with_timezone(&Utc))
}

/// Typed view over a raw request row. Parsing is lenient: unknown or blank
/// cells become `None` so the sweeps can pick up half-written rows.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestRecord {
    pub request_number: Option<RequestNumber>,
    pub timestamp: Option<DateTime<Utc>>,
    pub request_type: Option<RequestType>,
    pub department: String,
    pub business_unit: String,
    pub company_name: String,
    pub requester_email: String,
    pub attachment: Option<AttachmentRef>,
    pub total_task: Option<u32>,
    pub baseline: Option<i64>,
    pub estimated_time: Option<i64>,
    pub estimated_time_finished: Option<DateTime<Utc>>,
    pub processed_by: Option<String>,
    pub process_status: Option<ProcessStatus>,
    pub taken_date: Option<DateTime<Utc>>,
    pub processed_date: Option<DateTime<Utc>>,
    pub feedback_status: String,
    pub new_submission_status: Option<DateTime<Utc>>,
    pub levels: [ApprovalLevel; LEVEL_COUNT],
    pub ask_approval_sent: [bool; LEVEL_COUNT],
    pub sent_back_count: u32,
    pub sent_back_emails: u32,
}

impl RequestRecord {
    pub fn from_row(row: &RowValues) -> Self {
        let mut levels: [ApprovalLevel; LEVEL_COUNT] = Default::default();
        let mut ask_approval_sent = [false; LEVEL_COUNT];
        for (index, level) in levels.iter_mut().enumerate() {
            level.status = cell(row, columns::respon(index)).to_string();
            level.name = cell(row, columns::name(index)).to_string();
            level.timestamp = parse_cell_timestamp(row, columns::timestamp(index));
            if index > 0 {
                ask_approval_sent[index] = !cell(row, columns::ask_status(index)).is_empty();
            }
        }

        Self {
            request_number: {
                let raw = cell(row, columns::REQUEST_NUMBER);
                (!raw.is_empty()).then(|| RequestNumber(raw.to_string()))
            },
            timestamp: parse_cell_timestamp(row, columns::TIMESTAMP),
            request_type: RequestType::parse(cell(row, columns::REQUEST_TYPE)),
            department: cell(row, columns::DEPARTMENT).to_string(),
            business_unit: cell(row, columns::COMPANY_CODE).to_string(),
            company_name: cell(row, columns::COMPANY_NAME).to_string(),
            requester_email: cell(row, columns::EMAIL_ADDRESS).to_string(),
            attachment: {
                let raw = cell(row, columns::ATTACHMENT);
                (!raw.is_empty()).then(|| AttachmentRef(raw.to_string()))
            },
            total_task: cell(row, columns::TOTAL_TASK).parse().ok(),
            baseline: cell(row, columns::BASELINE).parse().ok(),
            estimated_time: cell(row, columns::ESTIMATED_TIME).parse().ok(),
            estimated_time_finished: parse_cell_timestamp(row, columns::ESTIMATED_TIME_FINISHED),
            processed_by: {
                let raw = cell(row, columns::PROCESSED_BY);
                (!raw.is_empty()).then(|| raw.to_string())
            },
            process_status: ProcessStatus::parse(cell(row, columns::PROCESS_STATUS)),
            taken_date: parse_cell_timestamp(row, columns::TAKEN_DATE),
            processed_date: parse_cell_timestamp(row, columns::PROCESSED_DATE),
            feedback_status: cell(row, columns::FEEDBACK_STATUS).to_string(),
            new_submission_status: parse_cell_timestamp(row, columns::NEW_SUBMISSION_STATUS),
            levels,
            ask_approval_sent,
            sent_back_count: cell(row, columns::SENT_BACK_COUNT).parse().unwrap_or(0),
            sent_back_emails: cell(row, columns::SENT_BACK_EMAIL_STATUS).parse().unwrap_or(0),
        }
    }

    pub fn requester_status(&self) -> Option<RequesterStatus> {
        RequesterStatus::parse(&self.levels[0].status)
    }

    pub fn approver_status(&self, level: usize) -> Option<ApproverStatus> {
        ApproverStatus::parse(&self.levels[level].status)
    }

    pub fn has_rejection(&self) -> bool {
        (1..LEVEL_COUNT).any(|level| {
            matches!(
                self.approver_status(level),
                Some(ApproverStatus::Rejected | ApproverStatus::SendBack)
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{
        columns, ApproverStatus, MasterTable, ProcessStatus, RequestNumber, RequestPrefix,
        RequestRecord, RequestType, RequesterStatus, RowValues,
    };

    #[test]
    fn request_number_formats_with_zero_padded_counter() {
        let prefix = RequestPrefix::new("BOM", "Retail Unit Alpha");
        let number = RequestNumber::format(&prefix, 1);

        assert_eq!(number.0, "BOM/MDM/Retail Unit Alpha/00001");
        assert_eq!(number.prefix(), Some("BOM/MDM/Retail Unit Alpha"));
        assert_eq!(number.counter(), Some(1));
    }

    #[test]
    fn request_type_round_trips_from_wire_encoding() {
        for request_type in RequestType::all() {
            assert_eq!(RequestType::parse(request_type.as_str()), Some(request_type));
        }
    }

    #[test]
    fn statuses_round_trip_from_wire_encoding() {
        for status in [
            RequesterStatus::Completed,
            RequesterStatus::Expired,
            RequesterStatus::Invalid,
            RequesterStatus::NeedReview,
        ] {
            assert_eq!(RequesterStatus::parse(status.as_str()), Some(status));
        }
        for status in [
            ApproverStatus::Approved,
            ApproverStatus::Rejected,
            ApproverStatus::PartiallyRejected,
            ApproverStatus::SendBack,
        ] {
            assert_eq!(ApproverStatus::parse(status.as_str()), Some(status));
        }
        for status in [
            ProcessStatus::OnGoing,
            ProcessStatus::Completed,
            ProcessStatus::PartiallyRejected,
            ProcessStatus::Rejected,
            ProcessStatus::SendBack,
        ] {
            assert_eq!(ProcessStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn pricing_create_tasks_start_below_the_extended_header() {
        assert_eq!(RequestType::PricingCreate.task_start_row(), 34);
        assert_eq!(RequestType::BomCreate.task_start_row(), 25);
    }

    #[test]
    fn every_request_type_maps_into_a_master_table() {
        for request_type in RequestType::all() {
            let table = request_type.master_table();
            assert!(MasterTable::all().contains(&table));
            assert!(!table.abbreviation().is_empty());
        }
    }

    #[test]
    fn record_parses_typed_fields_and_levels_from_raw_cells() {
        let mut row = RowValues::new();
        row.insert(columns::REQUEST_NUMBER.into(), "BOM/MDM/Retail Unit Alpha/00007".into());
        row.insert(columns::TIMESTAMP.into(), "2026-03-02T08:30:00+00:00".into());
        row.insert(columns::REQUEST_TYPE.into(), "BOM Create".into());
        row.insert(columns::COMPANY_CODE.into(), "BU01".into());
        row.insert(columns::TOTAL_TASK.into(), "5".into());
        row.insert(columns::respon(1).into(), "Approved".into());
        row.insert(columns::name(1).into(), "a@x".into());
        row.insert(columns::ask_status(2).into(), "2026-03-02T09:00:00+00:00".into());

        let record = RequestRecord::from_row(&row);

        assert_eq!(record.request_number.as_ref().map(|n| n.0.as_str()), Some("BOM/MDM/Retail Unit Alpha/00007"));
        assert_eq!(record.request_type, Some(RequestType::BomCreate));
        assert_eq!(record.total_task, Some(5));
        assert_eq!(record.approver_status(1), Some(ApproverStatus::Approved));
        assert_eq!(record.levels[1].name, "a@x");
        assert!(record.ask_approval_sent[2]);
        assert!(!record.ask_approval_sent[1]);
        assert_eq!(record.process_status, None);
    }

    #[test]
    fn rejection_detection_covers_send_back_and_rejected() {
        let mut row = RowValues::new();
        row.insert(columns::respon(2).into(), "Send Back".into());
        let record = RequestRecord::from_row(&row);
        assert!(record.has_rejection());

        let mut row = RowValues::new();
        row.insert(columns::respon(1).into(), "Approved".into());
        let record = RequestRecord::from_row(&row);
        assert!(!record.has_rejection());
    }
}
