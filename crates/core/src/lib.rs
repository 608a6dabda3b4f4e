// Re-export chrono for downstream crates that need DateTime types
pub use chrono;

pub mod allocator;
pub mod approval_sync;
pub mod attachment;
pub mod audit;
pub mod business_hours;
pub mod config;
pub mod config_cache;
pub mod domain;
pub mod errors;
pub mod fsm;
pub mod lock;
pub mod notify;
pub mod rowstore;
pub mod scheduler;
pub mod workload;

pub use allocator::{Allocator, AllocatorConfig, RoundRobinCursors, SPECIAL_PROJECT_DEPARTMENT};
pub use approval_sync::{ApprovalSync, LevelOutcome};
pub use attachment::{
    AttachmentDoc, AttachmentStore, InMemoryAttachmentStore, TaskColumn, TaskSheet,
    ValidationRule, ValueType,
};
pub use audit::{
    AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink, InMemoryAuditSink,
    SendBackActor,
};
pub use business_hours::{
    add_business_seconds, business_days_between, FixedHolidayCalendar, HolidayCalendar,
    SECONDS_PER_WORK_DAY,
};
pub use config_cache::{ConfigCache, InMemoryRuleSource, RuleSource};
pub use domain::agent::{Agent, AgentStatus};
pub use domain::approval::{ApprovalLevel, ExternalLevelCells, LEVEL_COUNT, NO_APPROVER};
pub use domain::request::{
    columns, ApproverStatus, AttachmentRef, MasterTable, ProcessStatus, RequestNumber,
    RequestPrefix, RequestRecord, RequestType, RequesterStatus, RowValues,
};
pub use domain::rules::{
    AllocationRule, ApproverRule, BaselineHit, BaselineRule, DistributionMatrix, PriorityWeight,
    TaskRange, ALL,
};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use fsm::{
    EditOutcome, IntervalOutcome, PreApproval, RequestEngine, SubmitOptions, SubmitOutcome,
};
pub use fsm::validation::{validate_sheets, RowValidationFailure, ValidationReport};
pub use lock::{
    row_key_lock_key, row_lock_key, InMemoryLeaseStore, LeaseRecord, LeaseStore, LockBeat,
    LockConfig, LockHandle, LockManager,
};
pub use notify::{
    send_with_retries, InMemoryNotifier, Notification, NotificationKind, Notifier,
};
pub use rowstore::{InMemoryRowStore, RowStore};
pub use scheduler::{
    needs_advancement, needs_resubmission, needs_send_back_email_retry, plan_sweep, SweepBudget,
};
pub use workload::{
    AgentStore, CounterStore, InMemoryAgentStore, InMemoryCounterStore, RequestNumberAllocator,
    WorkloadCounter,
};
