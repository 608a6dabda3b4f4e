//! Boundary to the external attachment document of a request.
//!
//! The engine reads and writes a fixed set of named cells: `F10` holds the
//! business-unit display name, and columns C..F carry the four approval
//! triples at rows 17 (status), 18 (name), 19 (notes). Task rows start at a
//! per-request-type offset; mandatory columns are marked by background color
//! and surface here as a flag on [`TaskColumn`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::approval::{ExternalLevelCells, LEVEL_COUNT};
use crate::domain::request::{AttachmentRef, RequestType};
use crate::errors::ApplicationError;

pub const COMPANY_NAME_CELL: &str = "F10";
pub const REQUESTER_EMAIL_CELL: &str = "F11";

const LEVEL_COLUMNS: [char; LEVEL_COUNT] = ['C', 'D', 'E', 'F'];
const STATUS_ROW: u32 = 17;
const NAME_ROW: u32 = 18;
const NOTES_ROW: u32 = 19;

pub fn status_cell(level: usize) -> String {
    format!("{}{}", LEVEL_COLUMNS[level], STATUS_ROW)
}

pub fn name_cell(level: usize) -> String {
    format!("{}{}", LEVEL_COLUMNS[level], NAME_ROW)
}

pub fn notes_cell(level: usize) -> String {
    format!("{}{}", LEVEL_COLUMNS[level], NOTES_ROW)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Integer,
    Float,
    Text,
}

/// Declared validation rule of a task column.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationRule {
    /// Value must be one of the listed options.
    Lookup { options: BTreeSet<String> },
    /// Value must be in the set keyed by another column's value.
    DependentLookup { key_column: String, sets: BTreeMap<String, BTreeSet<String>> },
    /// Value must match the pattern.
    Pattern { pattern: String },
    /// Pattern chosen by another column's value.
    DependentPattern { key_column: String, patterns: BTreeMap<String, String> },
    /// Value must parse as the given type.
    Typed { value_type: ValueType },
    /// Value passes when in the set, or when it matches the pattern keyed by
    /// another column.
    LookupOrDependentPattern {
        options: BTreeSet<String>,
        key_column: String,
        patterns: BTreeMap<String, String>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskColumn {
    pub name: String,
    pub mandatory: bool,
    pub rule: Option<ValidationRule>,
}

/// One task sheet inside the attachment, read starting at the type's task
/// start row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSheet {
    pub name: String,
    pub columns: Vec<TaskColumn>,
    pub rows: Vec<BTreeMap<String, String>>,
}

impl TaskSheet {
    pub fn non_empty_rows(&self) -> usize {
        self.rows
            .iter()
            .filter(|row| row.values().any(|value| !value.trim().is_empty()))
            .count()
    }
}

#[async_trait]
pub trait AttachmentStore: Send + Sync {
    /// Clones the template for `(request_type, business_unit)` into a fresh
    /// document and returns its handle.
    async fn clone_template(
        &self,
        request_type: RequestType,
        business_unit: &str,
    ) -> Result<AttachmentRef, ApplicationError>;

    async fn read_cell(
        &self,
        attachment: &AttachmentRef,
        cell: &str,
    ) -> Result<String, ApplicationError>;

    async fn write_cell(
        &self,
        attachment: &AttachmentRef,
        cell: &str,
        value: &str,
    ) -> Result<(), ApplicationError>;

    async fn read_level(
        &self,
        attachment: &AttachmentRef,
        level: usize,
    ) -> Result<ExternalLevelCells, ApplicationError>;

    /// Wipes the status/name/notes triples of every approval level.
    async fn clear_approval_cells(
        &self,
        attachment: &AttachmentRef,
    ) -> Result<(), ApplicationError>;

    /// Grants write scope on the level's triple to the roster.
    async fn grant_level_access(
        &self,
        attachment: &AttachmentRef,
        level: usize,
        emails: &[String],
    ) -> Result<(), ApplicationError>;

    async fn grant_editor(
        &self,
        attachment: &AttachmentRef,
        email: &str,
    ) -> Result<(), ApplicationError>;

    async fn set_protected(
        &self,
        attachment: &AttachmentRef,
        protected: bool,
    ) -> Result<(), ApplicationError>;

    /// Non-empty task rows summed across marked sheets.
    async fn count_task_rows(
        &self,
        attachment: &AttachmentRef,
    ) -> Result<u32, ApplicationError>;

    async fn task_sheets(
        &self,
        attachment: &AttachmentRef,
    ) -> Result<Vec<TaskSheet>, ApplicationError>;
}

#[derive(Clone, Debug, Default)]
pub struct AttachmentDoc {
    pub request_type: Option<RequestType>,
    pub cells: BTreeMap<String, String>,
    pub protected: bool,
    pub editors: Vec<String>,
    pub level_access: [Vec<String>; LEVEL_COUNT],
    pub sheets: Vec<TaskSheet>,
}

/// Simulated document store for tests: a map of documents with addressable
/// cells.
#[derive(Default)]
pub struct InMemoryAttachmentStore {
    docs: Mutex<HashMap<String, AttachmentDoc>>,
}

impl InMemoryAttachmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, AttachmentDoc>> {
        match self.docs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn insert(&self, attachment: &AttachmentRef, doc: AttachmentDoc) {
        self.lock().insert(attachment.0.clone(), doc);
    }

    pub fn snapshot(&self, attachment: &AttachmentRef) -> Option<AttachmentDoc> {
        self.lock().get(&attachment.0).cloned()
    }

    /// Simulates an approver acting on the document.
    pub fn record_action(&self, attachment: &AttachmentRef, level: usize, status: &str, name: &str) {
        let mut docs = self.lock();
        if let Some(doc) = docs.get_mut(&attachment.0) {
            doc.cells.insert(status_cell(level), status.to_string());
            doc.cells.insert(name_cell(level), name.to_string());
        }
    }

    pub fn record_notes(&self, attachment: &AttachmentRef, level: usize, notes: &str) {
        let mut docs = self.lock();
        if let Some(doc) = docs.get_mut(&attachment.0) {
            doc.cells.insert(notes_cell(level), notes.to_string());
        }
    }

    pub fn set_sheets(&self, attachment: &AttachmentRef, sheets: Vec<TaskSheet>) {
        let mut docs = self.lock();
        if let Some(doc) = docs.get_mut(&attachment.0) {
            doc.sheets = sheets;
        }
    }

    fn with_doc<T>(
        &self,
        attachment: &AttachmentRef,
        f: impl FnOnce(&mut AttachmentDoc) -> T,
    ) -> Result<T, ApplicationError> {
        let mut docs = self.lock();
        let doc = docs
            .get_mut(&attachment.0)
            .ok_or_else(|| ApplicationError::Integration(format!("no attachment {}", attachment.0)))?;
        Ok(f(doc))
    }
}

#[async_trait]
impl AttachmentStore for InMemoryAttachmentStore {
    async fn clone_template(
        &self,
        request_type: RequestType,
        business_unit: &str,
    ) -> Result<AttachmentRef, ApplicationError> {
        let attachment = AttachmentRef(format!(
            "att-{}-{}-{}",
            request_type.master_table().abbreviation().to_ascii_lowercase(),
            business_unit.to_ascii_lowercase().replace(' ', "-"),
            Uuid::new_v4()
        ));
        let doc = AttachmentDoc { request_type: Some(request_type), ..AttachmentDoc::default() };
        self.lock().insert(attachment.0.clone(), doc);
        Ok(attachment)
    }

    async fn read_cell(
        &self,
        attachment: &AttachmentRef,
        cell: &str,
    ) -> Result<String, ApplicationError> {
        self.with_doc(attachment, |doc| doc.cells.get(cell).cloned().unwrap_or_default())
    }

    async fn write_cell(
        &self,
        attachment: &AttachmentRef,
        cell: &str,
        value: &str,
    ) -> Result<(), ApplicationError> {
        self.with_doc(attachment, |doc| {
            doc.cells.insert(cell.to_string(), value.to_string());
        })
    }

    async fn read_level(
        &self,
        attachment: &AttachmentRef,
        level: usize,
    ) -> Result<ExternalLevelCells, ApplicationError> {
        self.with_doc(attachment, |doc| ExternalLevelCells {
            status: doc.cells.get(&status_cell(level)).cloned().unwrap_or_default(),
            name: doc.cells.get(&name_cell(level)).cloned().unwrap_or_default(),
            notes: doc.cells.get(&notes_cell(level)).cloned().unwrap_or_default(),
        })
    }

    async fn clear_approval_cells(
        &self,
        attachment: &AttachmentRef,
    ) -> Result<(), ApplicationError> {
        self.with_doc(attachment, |doc| {
            for level in 0..LEVEL_COUNT {
                doc.cells.remove(&status_cell(level));
                doc.cells.remove(&name_cell(level));
                doc.cells.remove(&notes_cell(level));
            }
        })
    }

    async fn grant_level_access(
        &self,
        attachment: &AttachmentRef,
        level: usize,
        emails: &[String],
    ) -> Result<(), ApplicationError> {
        self.with_doc(attachment, |doc| {
            doc.level_access[level] = emails.to_vec();
        })
    }

    async fn grant_editor(
        &self,
        attachment: &AttachmentRef,
        email: &str,
    ) -> Result<(), ApplicationError> {
        self.with_doc(attachment, |doc| {
            if !doc.editors.iter().any(|editor| editor == email) {
                doc.editors.push(email.to_string());
            }
        })
    }

    async fn set_protected(
        &self,
        attachment: &AttachmentRef,
        protected: bool,
    ) -> Result<(), ApplicationError> {
        self.with_doc(attachment, |doc| {
            doc.protected = protected;
        })
    }

    async fn count_task_rows(
        &self,
        attachment: &AttachmentRef,
    ) -> Result<u32, ApplicationError> {
        self.with_doc(attachment, |doc| {
            doc.sheets.iter().map(|sheet| sheet.non_empty_rows() as u32).sum()
        })
    }

    async fn task_sheets(
        &self,
        attachment: &AttachmentRef,
    ) -> Result<Vec<TaskSheet>, ApplicationError> {
        self.with_doc(attachment, |doc| doc.sheets.clone())
    }
}
