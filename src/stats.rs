//! Admission Statistics

use crate::pipeline::ReasonCode;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Admission counters
#[derive(Debug, Default)]
pub struct AdmissionStats {
    processed: AtomicU64,
    accepted: AtomicU64,
    errors: AtomicU64,
    extension_not_allowed: AtomicU64,
    content_mismatch: AtomicU64,
    string_mismatch: AtomicU64,
    forbidden_content: AtomicU64,
    threats: AtomicU64,
    scan_errors: AtomicU64,
}

impl AdmissionStats {
    /// Upload received
    pub fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Upload committed
    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// Policy, staging or commit failure
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Pipeline rejection
    pub fn record_rejected(&self, reason: ReasonCode) {
        let counter = match reason {
            ReasonCode::ExtensionNotAllowed => &self.extension_not_allowed,
            ReasonCode::ContentMismatch => &self.content_mismatch,
            ReasonCode::StringMismatch => &self.string_mismatch,
            ReasonCode::ForbiddenContentDetected => &self.forbidden_content,
            ReasonCode::ThreatDetected => &self.threats,
            ReasonCode::ScanError => &self.scan_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Get statistics snapshot
    pub fn snapshot(&self) -> AdmissionStatsSnapshot {
        let rejected = RejectionCounts {
            extension_not_allowed: self.extension_not_allowed.load(Ordering::Relaxed),
            content_mismatch: self.content_mismatch.load(Ordering::Relaxed),
            string_mismatch: self.string_mismatch.load(Ordering::Relaxed),
            forbidden_content_detected: self.forbidden_content.load(Ordering::Relaxed),
            threat_detected: self.threats.load(Ordering::Relaxed),
            scan_error: self.scan_errors.load(Ordering::Relaxed),
        };

        AdmissionStatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected_total: rejected.total(),
            errors: self.errors.load(Ordering::Relaxed),
            rejected,
        }
    }
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Serialize)]
pub struct AdmissionStatsSnapshot {
    /// Uploads received
    pub processed: u64,
    /// Uploads committed
    pub accepted: u64,
    /// Sum of all rejection reasons
    pub rejected_total: u64,
    /// Uploads that ended without a verdict or failed to commit
    pub errors: u64,
    /// Rejections by reason
    pub rejected: RejectionCounts,
}

/// Rejections per reason code
#[derive(Debug, Clone, Default, Serialize)]
pub struct RejectionCounts {
    /// `extension_not_allowed` rejections
    pub extension_not_allowed: u64,
    /// `content_mismatch` rejections
    pub content_mismatch: u64,
    /// `string_mismatch` rejections
    pub string_mismatch: u64,
    /// `forbidden_content_detected` rejections
    pub forbidden_content_detected: u64,
    /// `threat_detected` rejections
    pub threat_detected: u64,
    /// `scan_error` rejections
    pub scan_error: u64,
}

impl RejectionCounts {
    fn total(&self) -> u64 {
        self.extension_not_allowed
            + self.content_mismatch
            + self.string_mismatch
            + self.forbidden_content_detected
            + self.threat_detected
            + self.scan_error
    }
}
