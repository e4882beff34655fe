//! Domain types for the IMS registry: investigation report records, their
//! lifecycle enums, merge grouping, audit history payloads, and the role
//! permission matrix. Storage-free; the sqlite store crate builds on this.

use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ImsError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid state: {0}")]
    State(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct UserId(pub Ulid);

impl UserId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// # Errors
    /// Returns [`ImsError::Validation`] when the value is not a ULID.
    pub fn parse(value: &str) -> Result<Self, ImsError> {
        Ulid::from_string(value)
            .map(Self)
            .map_err(|err| ImsError::Validation(format!("invalid user id {value:?}: {err}")))
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TagId(pub Ulid);

impl TagId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// # Errors
    /// Returns [`ImsError::Validation`] when the value is not a ULID.
    pub fn parse(value: &str) -> Result<Self, ImsError> {
        Ulid::from_string(value)
            .map(Self)
            .map_err(|err| ImsError::Validation(format!("invalid tag id {value:?}: {err}")))
    }
}

impl Display for TagId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ImsId(pub Ulid);

impl ImsId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// # Errors
    /// Returns [`ImsError::Validation`] when the value is not a ULID.
    pub fn parse(value: &str) -> Result<Self, ImsError> {
        Ulid::from_string(value)
            .map(Self)
            .map_err(|err| ImsError::Validation(format!("invalid IMS id {value:?}: {err}")))
    }
}

impl Display for ImsId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MergeId(pub Ulid);

impl MergeId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// # Errors
    /// Returns [`ImsError::Validation`] when the value is not a ULID.
    pub fn parse(value: &str) -> Result<Self, ImsError> {
        Ulid::from_string(value)
            .map(Self)
            .map_err(|err| ImsError::Validation(format!("invalid merge id {value:?}: {err}")))
    }
}

impl Display for MergeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Human-facing sequential report identifier, rendered as `CCD-<n>`.
///
/// Held and compared numerically; leading zeros are rejected so the text
/// rendering is canonical.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct CcdId(u64);

impl CcdId {
    #[must_use]
    pub fn from_number(number: u64) -> Option<Self> {
        (number >= 1).then_some(Self(number))
    }

    #[must_use]
    pub fn number(self) -> u64 {
        self.0
    }

    /// # Errors
    /// Returns [`ImsError::Validation`] unless the value is `CCD-<n>` with a
    /// canonical positive suffix.
    pub fn parse(value: &str) -> Result<Self, ImsError> {
        let suffix = value.strip_prefix("CCD-").ok_or_else(|| {
            ImsError::Validation(format!("invalid ccd id {value:?}: expected CCD-<n>"))
        })?;

        if suffix.len() > 1 && suffix.starts_with('0') {
            return Err(ImsError::Validation(format!(
                "invalid ccd id {value:?}: leading zeros are not allowed"
            )));
        }

        let number: u64 = suffix.parse().map_err(|_| {
            ImsError::Validation(format!("invalid ccd id {value:?}: non-numeric suffix"))
        })?;

        Self::from_number(number)
            .ok_or_else(|| ImsError::Validation(format!("invalid ccd id {value:?}: n MUST be >= 1")))
    }
}

impl Display for CcdId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "CCD-{}", self.0)
    }
}

impl From<CcdId> for String {
    fn from(value: CcdId) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for CcdId {
    type Error = ImsError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ImsStatus {
    Draft,
    InProgress,
    Completed,
    Merged,
    Archived,
}

impl ImsStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Merged => "merged",
            Self::Archived => "archived",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(Self::Draft),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "merged" => Some(Self::Merged),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Urgent,
    High,
    Medium,
    Low,
}

impl Priority {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Urgent => "urgent",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "urgent" => Some(Self::Urgent),
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Analyst,
    Viewer,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Analyst => "analyst",
            Self::Viewer => "viewer",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "admin" => Some(Self::Admin),
            "analyst" => Some(Self::Analyst),
            "viewer" => Some(Self::Viewer),
            _ => None,
        }
    }

    /// Role permission matrix, checked by the request boundary before any
    /// store operation is dispatched.
    #[must_use]
    pub fn permits(self, operation: Operation) -> bool {
        match operation {
            Operation::ViewIms
            | Operation::ViewTags
            | Operation::ViewMerges
            | Operation::ViewUsers
            | Operation::ViewDashboard
            | Operation::CreateIms
            | Operation::UpdateIms => true,
            Operation::DeleteIms
            | Operation::CreateTag
            | Operation::UpdateTag
            | Operation::CreateMerge
            | Operation::Unmerge => matches!(self, Self::Admin | Self::Analyst),
            Operation::RestoreIms
            | Operation::DeleteTag
            | Operation::DeleteMerge
            | Operation::ManageUsers => matches!(self, Self::Admin),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    ViewIms,
    CreateIms,
    UpdateIms,
    DeleteIms,
    RestoreIms,
    ViewTags,
    CreateTag,
    UpdateTag,
    DeleteTag,
    ViewMerges,
    CreateMerge,
    Unmerge,
    DeleteMerge,
    ViewDashboard,
    ViewUsers,
    ManageUsers,
}

impl Operation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ViewIms => "view_ims",
            Self::CreateIms => "create_ims",
            Self::UpdateIms => "update_ims",
            Self::DeleteIms => "delete_ims",
            Self::RestoreIms => "restore_ims",
            Self::ViewTags => "view_tags",
            Self::CreateTag => "create_tag",
            Self::UpdateTag => "update_tag",
            Self::DeleteTag => "delete_tag",
            Self::ViewMerges => "view_merges",
            Self::CreateMerge => "create_merge",
            Self::Unmerge => "unmerge",
            Self::DeleteMerge => "delete_merge",
            Self::ViewDashboard => "view_dashboard",
            Self::ViewUsers => "view_users",
            Self::ManageUsers => "manage_users",
        }
    }
}

/// Rejects the operation unless the role's permission matrix allows it.
///
/// # Errors
/// Returns [`ImsError::Forbidden`] when the role may not perform the
/// operation.
pub fn authorize(role: Role, operation: Operation) -> Result<(), ImsError> {
    if role.permits(operation) {
        return Ok(());
    }
    Err(ImsError::Forbidden(format!(
        "role {} may not perform {}",
        role.as_str(),
        operation.as_str()
    )))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    Created,
    Updated,
    Deleted,
    Restored,
    Merged,
    Unmerged,
}

impl HistoryAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
            Self::Restored => "restored",
            Self::Merged => "merged",
            Self::Unmerged => "unmerged",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created" => Some(Self::Created),
            "updated" => Some(Self::Updated),
            "deleted" => Some(Self::Deleted),
            "restored" => Some(Self::Restored),
            "merged" => Some(Self::Merged),
            "unmerged" => Some(Self::Unmerged),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    CreatedAt,
    UpdatedAt,
    Date,
    CcdId,
}

impl SortField {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CreatedAt => "created_at",
            Self::UpdatedAt => "updated_at",
            Self::Date => "date",
            Self::CcdId => "ccd_id",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created_at" => Some(Self::CreatedAt),
            "updated_at" => Some(Self::UpdatedAt),
            "date" => Some(Self::Date),
            "ccd_id" => Some(Self::CcdId),
            _ => None,
        }
    }

    /// Column this sort key maps to. `ccd_id` sorts on the numeric column so
    /// CCD-10 orders after CCD-9.
    #[must_use]
    pub fn column(self) -> &'static str {
        match self {
            Self::CreatedAt => "created_at",
            Self::UpdatedAt => "updated_at",
            Self::Date => "date",
            Self::CcdId => "ccd_num",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "asc" => Some(Self::Asc),
            "desc" => Some(Self::Desc),
            _ => None,
        }
    }

    #[must_use]
    pub fn keyword(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub full_name: String,
    pub role: Role,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// The slice of a user every other record embeds.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct UserSummary {
    pub id: UserId,
    pub full_name: String,
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Tag {
    pub id: TagId,
    pub name: String,
    pub color: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TagUsage {
    pub id: TagId,
    pub name: String,
    pub color: String,
    pub usage: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Ims {
    pub id: ImsId,
    pub ccd_id: CcdId,
    pub report_name: String,
    pub description: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub date: Option<OffsetDateTime>,
    pub link_opencti: Option<String>,
    pub link_docintel: Option<String>,
    pub comments: Option<String>,
    pub status: ImsStatus,
    pub priority: Priority,
    pub analyst: Option<UserSummary>,
    pub created_by: UserSummary,
    pub tags: Vec<Tag>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub deleted_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Listing/dashboard row: the record without its heavier associations.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ImsSummary {
    pub id: ImsId,
    pub ccd_id: CcdId,
    pub report_name: String,
    pub status: ImsStatus,
    pub priority: Priority,
    pub analyst: Option<UserSummary>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub entry_seq: i64,
    pub ims_id: ImsId,
    pub action: HistoryAction,
    pub changes: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AssignmentEntry {
    pub entry_seq: i64,
    pub ims_id: ImsId,
    pub analyst: UserSummary,
    #[serde(with = "time::serde::rfc3339")]
    pub assigned_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Merge {
    pub id: MergeId,
    pub merge_name: String,
    pub description: Option<String>,
    pub reason: Option<String>,
    pub created_by: UserSummary,
    #[serde(with = "time::serde::rfc3339")]
    pub merged_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub unmerged_at: Option<OffsetDateTime>,
    pub items: Vec<MergeItemSummary>,
}

impl Merge {
    /// An active merge still claims its members; a closed one is history.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.unmerged_at.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MergeItemSummary {
    pub ims_id: ImsId,
    pub ccd_id: CcdId,
    pub report_name: String,
    pub status: ImsStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct CreateImsInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub ccd_id: Option<CcdId>,
    pub report_name: String,
    pub description: String,
    #[serde(with = "time::serde::rfc3339::option")]
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub date: Option<OffsetDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub link_opencti: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub link_docintel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub comments: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub status: Option<ImsStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub analyst_id: Option<UserId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub tag_ids: Option<Vec<TagId>>,
}

impl CreateImsInput {
    /// Validates the creation payload before any write.
    ///
    /// # Errors
    /// Returns [`ImsError::Validation`] when required fields are missing or
    /// reference links are not http(s) URLs.
    pub fn validate(&self) -> Result<(), ImsError> {
        if self.report_name.trim().is_empty() {
            return Err(ImsError::Validation(
                "report_name MUST NOT be empty".to_string(),
            ));
        }

        if self.description.trim().is_empty() {
            return Err(ImsError::Validation(
                "description MUST NOT be empty".to_string(),
            ));
        }

        if let Some(link) = &self.link_opencti {
            check_link("link_opencti", link)?;
        }

        if let Some(link) = &self.link_docintel {
            check_link("link_docintel", link)?;
        }

        Ok(())
    }
}

/// Partial update: an absent field means "leave unchanged". There is no way
/// to clear a field back to null through this input.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct UpdateImsInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub report_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub description: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub date: Option<OffsetDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub link_opencti: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub link_docintel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub comments: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub status: Option<ImsStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub analyst_id: Option<UserId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub tag_ids: Option<Vec<TagId>>,
}

impl UpdateImsInput {
    /// Validates the update payload before any write.
    ///
    /// # Errors
    /// Returns [`ImsError::Validation`] when a provided field is empty or a
    /// reference link is not an http(s) URL.
    pub fn validate(&self) -> Result<(), ImsError> {
        if let Some(name) = &self.report_name {
            if name.trim().is_empty() {
                return Err(ImsError::Validation(
                    "report_name MUST NOT be empty".to_string(),
                ));
            }
        }

        if let Some(description) = &self.description {
            if description.trim().is_empty() {
                return Err(ImsError::Validation(
                    "description MUST NOT be empty".to_string(),
                ));
            }
        }

        if let Some(link) = &self.link_opencti {
            check_link("link_opencti", link)?;
        }

        if let Some(link) = &self.link_docintel {
            check_link("link_docintel", link)?;
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CreateMergeInput {
    pub merge_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub reason: Option<String>,
    pub ims_ids: Vec<ImsId>,
}

impl CreateMergeInput {
    /// Validates merge arity and member uniqueness before any store check.
    ///
    /// # Errors
    /// Returns [`ImsError::Validation`] for an empty name, fewer than two
    /// members, or repeated member ids.
    pub fn validate(&self) -> Result<(), ImsError> {
        if self.merge_name.trim().is_empty() {
            return Err(ImsError::Validation(
                "merge_name MUST NOT be empty".to_string(),
            ));
        }

        if self.ims_ids.len() < 2 {
            return Err(ImsError::Validation(
                "at least 2 IMS are required for a merge".to_string(),
            ));
        }

        let distinct: BTreeSet<ImsId> = self.ims_ids.iter().copied().collect();
        if distinct.len() != self.ims_ids.len() {
            return Err(ImsError::Validation(
                "merge member ids MUST be distinct".to_string(),
            ));
        }

        Ok(())
    }
}

pub const DEFAULT_TAG_COLOR: &str = "#3B82F6";

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CreateTagInput {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub color: Option<String>,
}

impl CreateTagInput {
    /// # Errors
    /// Returns [`ImsError::Validation`] for an empty name or a color that is
    /// not `#RRGGBB`.
    pub fn validate(&self) -> Result<(), ImsError> {
        if self.name.trim().is_empty() {
            return Err(ImsError::Validation("name MUST NOT be empty".to_string()));
        }

        if let Some(color) = &self.color {
            check_color(color)?;
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct UpdateTagInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub color: Option<String>,
}

impl UpdateTagInput {
    /// # Errors
    /// Returns [`ImsError::Validation`] for an empty name or a color that is
    /// not `#RRGGBB`.
    pub fn validate(&self) -> Result<(), ImsError> {
        if let Some(name) = &self.name {
            if name.trim().is_empty() {
                return Err(ImsError::Validation("name MUST NOT be empty".to_string()));
            }
        }

        if let Some(color) = &self.color {
            check_color(color)?;
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CreateUserInput {
    pub email: String,
    pub full_name: String,
    pub role: Role,
}

impl CreateUserInput {
    /// # Errors
    /// Returns [`ImsError::Validation`] for a malformed email or empty name.
    pub fn validate(&self) -> Result<(), ImsError> {
        let email = self.email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(ImsError::Validation(format!(
                "invalid email address {:?}",
                self.email
            )));
        }

        if self.full_name.trim().is_empty() {
            return Err(ImsError::Validation(
                "full_name MUST NOT be empty".to_string(),
            ));
        }

        Ok(())
    }
}

fn check_link(field: &str, value: &str) -> Result<(), ImsError> {
    if value.starts_with("http://") || value.starts_with("https://") {
        return Ok(());
    }
    Err(ImsError::Validation(format!(
        "{field} MUST be an http(s) URL, got {value:?}"
    )))
}

fn check_color(value: &str) -> Result<(), ImsError> {
    let is_hex = value.len() == 7
        && value.starts_with('#')
        && value[1..].chars().all(|c| c.is_ascii_hexdigit());
    if is_hex {
        return Ok(());
    }
    Err(ImsError::Validation(format!(
        "color MUST be #RRGGBB, got {value:?}"
    )))
}

pub const DEFAULT_PAGE_LIMIT: u32 = 10;
pub const MAX_PAGE_LIMIT: u32 = 100;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ImsFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub search: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub status: Option<ImsStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub analyst_id: Option<UserId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub tag_id: Option<TagId>,
    pub page: u32,
    pub limit: u32,
    pub sort_by: SortField,
    pub sort_order: SortOrder,
}

impl Default for ImsFilter {
    fn default() -> Self {
        Self {
            search: None,
            status: None,
            priority: None,
            analyst_id: None,
            tag_id: None,
            page: 1,
            limit: DEFAULT_PAGE_LIMIT,
            sort_by: SortField::CreatedAt,
            sort_order: SortOrder::Desc,
        }
    }
}

impl ImsFilter {
    /// # Errors
    /// Returns [`ImsError::Validation`] when pagination bounds are out of
    /// range.
    pub fn validate(&self) -> Result<(), ImsError> {
        if self.page < 1 {
            return Err(ImsError::Validation("page MUST be >= 1".to_string()));
        }

        if self.limit < 1 || self.limit > MAX_PAGE_LIMIT {
            return Err(ImsError::Validation(format!(
                "limit MUST be between 1 and {MAX_PAGE_LIMIT}"
            )));
        }

        Ok(())
    }

    #[must_use]
    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.limit)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
    pub total_pages: u32,
}

impl<T> Page<T> {
    #[must_use]
    pub fn new(items: Vec<T>, total: u64, page: u32, limit: u32) -> Self {
        let total_pages =
            u32::try_from(total.div_ceil(u64::from(limit.max(1)))).unwrap_or(u32::MAX);
        Self {
            items,
            total,
            page,
            limit,
            total_pages,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DashboardOverview {
    pub total_ims: u64,
    pub total_analysts: u64,
    pub total_tags: u64,
    pub active_merges: u64,
    pub unassigned_ims: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StatusCount {
    pub status: ImsStatus,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PriorityCount {
    pub priority: Priority,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AnalystWorkload {
    pub id: UserId,
    pub full_name: String,
    pub email: String,
    pub active_ims: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DashboardStats {
    pub overview: DashboardOverview,
    pub status_distribution: Vec<StatusCount>,
    pub priority_distribution: Vec<PriorityCount>,
    pub recent_ims: Vec<ImsSummary>,
    pub analyst_workload: Vec<AnalystWorkload>,
    pub top_tags: Vec<TagUsage>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalystStats {
    pub total_assigned: u64,
    pub status_distribution: Vec<StatusCount>,
    pub recent_activity: Vec<ImsSummary>,
    pub completion_rate: f64,
}

/// Creation count for one UTC calendar day.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TimelinePoint {
    pub date: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DashboardTimeline {
    pub period: String,
    pub data: Vec<TimelinePoint>,
}

/// One metric compared across the trailing window and everything before it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TrendWindow {
    pub current: u64,
    pub previous: u64,
    pub percentage_change: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct DashboardTrends {
    pub creation: TrendWindow,
    pub completion: TrendWindow,
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`ImsError::Validation`] when parsing fails or the timestamp is
/// not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, ImsError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| ImsError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(ImsError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`ImsError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, ImsError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| ImsError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
