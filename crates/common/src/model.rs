//! Persisted data model shared between the trust core and its storage collaborator.

use std::{collections::BTreeSet, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Storage form of a protected national identity number.
///
/// The raw number is never part of this record. `lookup_hash` is the only
/// handle usable for existence checks and carries a uniqueness constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityRecord {
    /// `IV(16) ‖ AuthTag(16) ‖ Ciphertext` of the pseudonym.
    pub encrypted_token: Vec<u8>,
    /// Hex-encoded one-way hash of the pseudonym.
    pub lookup_hash: String,
}

// ---------------------------------------------------------------------------
// Consent
// ---------------------------------------------------------------------------

/// Closed set of capabilities a consent grant can authorise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scope {
    ViewIdentityNumber,
    ViewMedicalRecords,
    ViewPrescriptions,
    ViewLabResults,
    ManageAppointments,
}

impl Scope {
    /// Every scope, in declaration order.
    pub const ALL: [Scope; 5] = [
        Scope::ViewIdentityNumber,
        Scope::ViewMedicalRecords,
        Scope::ViewPrescriptions,
        Scope::ViewLabResults,
        Scope::ManageAppointments,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::ViewIdentityNumber => "view-identity-number",
            Scope::ViewMedicalRecords => "view-medical-records",
            Scope::ViewPrescriptions => "view-prescriptions",
            Scope::ViewLabResults => "view-lab-results",
            Scope::ManageAppointments => "manage-appointments",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Scope::ALL
            .into_iter()
            .find(|scope| scope.as_str() == s)
            .ok_or_else(|| format!("unknown scope: {s}"))
    }
}

/// A persisted delegation grant.
///
/// Created on grant, mutated only by revocation, never deleted. The record,
/// not the bearer token, is the source of authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentGrant {
    pub id: Uuid,
    pub subject_id: String,
    pub grantee_id: String,
    pub scopes: BTreeSet<Scope>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
}

impl ConsentGrant {
    /// True when the grant is not revoked and `now` is before its expiry.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && now < self.expires_at
    }

    /// Scopes in `required` that this grant does not cover.
    pub fn missing_scopes(&self, required: &BTreeSet<Scope>) -> BTreeSet<Scope> {
        required.difference(&self.scopes).copied().collect()
    }
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

/// Security-relevant actions recorded by the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    IdentityRegistered,
    IdentityViewed,
    LoginSucceeded,
    LoginFailed,
    SessionRefreshed,
    ConsentGranted,
    ConsentRevoked,
    ConsentVerified,
    ConsentDenied,
    PrescriptionCreated,
    PrescriptionVerified,
    QrVerificationFailed,
    MedicineDispensed,
    RecordUpdated,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::IdentityRegistered => "IDENTITY_REGISTERED",
            AuditAction::IdentityViewed => "IDENTITY_VIEWED",
            AuditAction::LoginSucceeded => "LOGIN_SUCCEEDED",
            AuditAction::LoginFailed => "LOGIN_FAILED",
            AuditAction::SessionRefreshed => "SESSION_REFRESHED",
            AuditAction::ConsentGranted => "CONSENT_GRANTED",
            AuditAction::ConsentRevoked => "CONSENT_REVOKED",
            AuditAction::ConsentVerified => "CONSENT_VERIFIED",
            AuditAction::ConsentDenied => "CONSENT_DENIED",
            AuditAction::PrescriptionCreated => "PRESCRIPTION_CREATED",
            AuditAction::PrescriptionVerified => "PRESCRIPTION_VERIFIED",
            AuditAction::QrVerificationFailed => "QR_VERIFICATION_FAILED",
            AuditAction::MedicineDispensed => "MEDICINE_DISPENSED",
            AuditAction::RecordUpdated => "RECORD_UPDATED",
        }
    }

    /// Critical actions are anchored to the external ledger in addition to
    /// the local store.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            AuditAction::IdentityViewed
                | AuditAction::ConsentGranted
                | AuditAction::ConsentRevoked
                | AuditAction::PrescriptionCreated
                | AuditAction::MedicineDispensed
        )
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable audit record.
///
/// `ledger_ref` is the only field ever written after creation, and only once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: Uuid,
    pub actor: String,
    pub action: AuditAction,
    pub resource_type: String,
    pub resource_id: String,
    pub timestamp: DateTime<Utc>,
    /// Hex SHA-256 over the canonical core fields.
    pub local_hash: String,
    pub ledger_ref: Option<String>,
}
