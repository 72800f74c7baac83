//! The Notice aggregate and its conditional mutation engine.
//!
//! Every write to a notice is expressed as a [`NoticeMutation`]. The store
//! evaluates [`Notice::apply`] atomically against the current row, so a
//! milestone is only written when it is still absent and terminal notices
//! never have their delivery fields touched.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::types::{
    Channel, CompanyId, ContentHash, EmployeeId, NoticeId, ProviderMessageId, Timestamp,
    SECONDS_PER_DAY,
};

/// Days between read confirmation and automatic firmness. Legal constant.
pub const FIRMNESS_PERIOD_SECS: u64 = 30 * SECONDS_PER_DAY;

// ---------------------------------------------------------------------------
// Content
// ---------------------------------------------------------------------------

/// Legally relevant content of a notice. Everything here is covered by the
/// content hash; nothing volatile belongs in this struct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoticeContent {
    pub employee_id: EmployeeId,
    pub company_id: CompanyId,
    pub sanction_type: String,
    pub sanction_days: u32,
    pub incident_date: NaiveDate,
    pub summary: String,
    pub body: String,
}

// ---------------------------------------------------------------------------
// Lifecycle state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Draft,
    Dispatched,
    IdentityValidated,
    ReadConfirmed,
    Firm,
    Impugned,
}

impl LifecycleState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Firm | LifecycleState::Impugned)
    }

    fn rank(&self) -> u8 {
        match self {
            LifecycleState::Draft => 0,
            LifecycleState::Dispatched => 1,
            LifecycleState::IdentityValidated => 2,
            LifecycleState::ReadConfirmed => 3,
            LifecycleState::Firm | LifecycleState::Impugned => 4,
        }
    }

    /// Canonical transitions. Forward along the main track, one step of
    /// impugnment from read confirmation, and the declined-impugnment path.
    pub fn can_transition_to(&self, next: LifecycleState) -> bool {
        matches!(
            (self, next),
            (LifecycleState::Draft, LifecycleState::Dispatched)
                | (LifecycleState::Dispatched, LifecycleState::IdentityValidated)
                | (LifecycleState::Dispatched, LifecycleState::ReadConfirmed)
                | (LifecycleState::IdentityValidated, LifecycleState::ReadConfirmed)
                | (LifecycleState::ReadConfirmed, LifecycleState::Firm)
                | (LifecycleState::ReadConfirmed, LifecycleState::Impugned)
                | (LifecycleState::Impugned, LifecycleState::Firm)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Draft => "draft",
            LifecycleState::Dispatched => "dispatched",
            LifecycleState::IdentityValidated => "identity_validated",
            LifecycleState::ReadConfirmed => "read_confirmed",
            LifecycleState::Firm => "firm",
            LifecycleState::Impugned => "impugned",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhysicalTrack {
    NotRequired,
    Required,
    Dispatched,
}

impl PhysicalTrack {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhysicalTrack::NotRequired => "not_required",
            PhysicalTrack::Required => "required",
            PhysicalTrack::Dispatched => "dispatched",
        }
    }
}

/// Why a notice reached `firm`. Renders identically, kept apart for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirmBasis {
    AutoPromoted,
    ImpugnmentDeclined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadMethod {
    Checkbox,
    ComprehensionChallenge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenSource {
    Webhook,
    Reconciliation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofState {
    Absent,
    Pending,
    Confirmed,
    Failed,
}

impl ProofState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProofState::Absent => "absent",
            ProofState::Pending => "pending",
            ProofState::Confirmed => "confirmed",
            ProofState::Failed => "failed",
        }
    }
}

// ---------------------------------------------------------------------------
// Per-channel delivery facts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelDelivery {
    pub dispatched_at: Option<Timestamp>,
    pub provider_message_id: Option<ProviderMessageId>,
    pub delivered_at: Option<Timestamp>,
    pub first_opened_at: Option<Timestamp>,
    pub open_source: Option<OpenSource>,
    pub failed_at: Option<Timestamp>,
    pub failure_reason: Option<String>,
}

// ---------------------------------------------------------------------------
// Notice
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notice {
    pub id: NoticeId,
    pub content: NoticeContent,
    pub content_hash: ContentHash,
    pub created_at: Timestamp,
    pub channels: BTreeMap<Channel, ChannelDelivery>,
    pub identity_validated_at: Option<Timestamp>,
    pub code_validated_at: Option<Timestamp>,
    pub biometric_completed_at: Option<Timestamp>,
    pub biometric_contingency: bool,
    pub read_confirmed_at: Option<Timestamp>,
    pub read_method: Option<ReadMethod>,
    pub expires_at: Option<Timestamp>,
    pub state: LifecycleState,
    pub physical_fallback_required: bool,
    pub physical_track: PhysicalTrack,
    pub physical_required_at: Option<Timestamp>,
    pub physical_dispatched_at: Option<Timestamp>,
    pub impugned_at: Option<Timestamp>,
    pub firm_at: Option<Timestamp>,
    pub firm_basis: Option<FirmBasis>,
    pub notary_token: Option<String>,
    pub blockchain_proof: ProofState,
    /// Optimistic concurrency counter, bumped on every applied mutation.
    pub version: u64,
}

impl Notice {
    /// A fresh draft notice. The caller supplies the already computed hash.
    pub fn draft(
        id: NoticeId,
        content: NoticeContent,
        content_hash: ContentHash,
        created_at: Timestamp,
        expires_at: Option<Timestamp>,
    ) -> Self {
        Self {
            id,
            content,
            content_hash,
            created_at,
            channels: BTreeMap::new(),
            identity_validated_at: None,
            code_validated_at: None,
            biometric_completed_at: None,
            biometric_contingency: false,
            read_confirmed_at: None,
            read_method: None,
            expires_at,
            state: LifecycleState::Draft,
            physical_fallback_required: false,
            physical_track: PhysicalTrack::NotRequired,
            physical_required_at: None,
            physical_dispatched_at: None,
            impugned_at: None,
            firm_at: None,
            firm_basis: None,
            notary_token: None,
            blockchain_proof: ProofState::Absent,
            version: 0,
        }
    }

    /// Earliest dispatch across all channels.
    pub fn first_dispatched_at(&self) -> Option<Timestamp> {
        self.channels.values().filter_map(|c| c.dispatched_at).min()
    }

    /// Earliest confirmed open across all channels, webhook or reconciled.
    pub fn first_opened_at(&self) -> Option<Timestamp> {
        self.channels.values().filter_map(|c| c.first_opened_at).min()
    }

    pub fn has_open(&self) -> bool {
        self.first_opened_at().is_some()
    }

    /// The accessor reached the gatekeeper, which proves receipt even when
    /// the channel never reports an open (SMS).
    pub fn recipient_engaged(&self) -> bool {
        self.identity_validated_at.is_some() || self.read_confirmed_at.is_some()
    }

    pub fn any_channel_failed(&self) -> bool {
        self.channels.values().any(|c| c.failed_at.is_some())
    }

    pub fn dispatched_channels(&self) -> Vec<(Channel, ProviderMessageId)> {
        self.channels
            .iter()
            .filter_map(|(channel, d)| d.provider_message_id.clone().map(|m| (*channel, m)))
            .collect()
    }

    fn set_state(&mut self, next: LifecycleState) {
        if self.state.rank() < next.rank() && self.state.can_transition_to(next) {
            self.state = next;
        }
    }

    /// Evaluate a mutation against this notice, changing it only when every
    /// precondition holds. The outcome tells the caller what happened.
    pub fn apply(&mut self, mutation: &NoticeMutation) -> MutationOutcome {
        if mutation.touches_delivery_fields() && self.state.is_terminal() {
            return MutationOutcome::Rejected(RejectReason::TerminalState);
        }

        let outcome = match mutation {
            NoticeMutation::Dispatch {
                channel,
                provider_message_id,
                at,
            } => {
                let entry = self.channels.entry(*channel).or_default();
                if entry.dispatched_at.is_some() {
                    MutationOutcome::AlreadySet
                } else {
                    entry.dispatched_at = Some(*at);
                    entry.provider_message_id = Some(provider_message_id.clone());
                    self.set_state(LifecycleState::Dispatched);
                    MutationOutcome::Applied
                }
            }
            NoticeMutation::Delivered { channel, at } => match self.channels.get_mut(channel) {
                Some(entry) if entry.dispatched_at.is_some() => {
                    if entry.delivered_at.is_some() {
                        MutationOutcome::AlreadySet
                    } else {
                        entry.delivered_at = Some(*at);
                        MutationOutcome::Applied
                    }
                }
                _ => MutationOutcome::Rejected(RejectReason::NotDispatched),
            },
            NoticeMutation::FirstOpen {
                channel,
                at,
                source,
            } => match self.channels.get_mut(channel) {
                Some(entry) if entry.dispatched_at.is_some() => {
                    if entry.first_opened_at.is_some() {
                        MutationOutcome::AlreadySet
                    } else {
                        entry.first_opened_at = Some(*at);
                        entry.open_source = Some(*source);
                        MutationOutcome::Applied
                    }
                }
                _ => MutationOutcome::Rejected(RejectReason::NotDispatched),
            },
            NoticeMutation::ChannelFailed {
                channel,
                at,
                reason,
            } => match self.channels.get_mut(channel) {
                Some(entry) if entry.dispatched_at.is_some() => {
                    if entry.failed_at.is_some() {
                        MutationOutcome::AlreadySet
                    } else {
                        entry.failed_at = Some(*at);
                        entry.failure_reason = Some(reason.clone());
                        self.physical_fallback_required = true;
                        MutationOutcome::Applied
                    }
                }
                _ => MutationOutcome::Rejected(RejectReason::NotDispatched),
            },
            NoticeMutation::IdentityValidated { at } => {
                if self.identity_validated_at.is_some() {
                    MutationOutcome::AlreadySet
                } else if self.first_dispatched_at().is_none() {
                    MutationOutcome::Rejected(RejectReason::NotDispatched)
                } else {
                    self.identity_validated_at = Some(*at);
                    self.set_state(LifecycleState::IdentityValidated);
                    MutationOutcome::Applied
                }
            }
            NoticeMutation::CodeValidated { at } => {
                if self.code_validated_at.is_some() {
                    MutationOutcome::AlreadySet
                } else if self.identity_validated_at.is_none() {
                    MutationOutcome::Rejected(RejectReason::MissingPrerequisite)
                } else {
                    self.code_validated_at = Some(*at);
                    MutationOutcome::Applied
                }
            }
            NoticeMutation::BiometricCompleted { at, contingency } => {
                if self.biometric_completed_at.is_some() {
                    MutationOutcome::AlreadySet
                } else if self.code_validated_at.is_none() {
                    MutationOutcome::Rejected(RejectReason::MissingPrerequisite)
                } else {
                    self.biometric_completed_at = Some(*at);
                    self.biometric_contingency = *contingency;
                    MutationOutcome::Applied
                }
            }
            NoticeMutation::ReadConfirmed { at, method } => {
                if self.read_confirmed_at.is_some() {
                    MutationOutcome::AlreadySet
                } else if self.identity_validated_at.is_none() {
                    MutationOutcome::Rejected(RejectReason::MissingPrerequisite)
                } else {
                    self.read_confirmed_at = Some(*at);
                    self.read_method = Some(*method);
                    if self.expires_at.is_none() {
                        self.expires_at = Some(at.plus_seconds(FIRMNESS_PERIOD_SECS));
                    }
                    self.set_state(LifecycleState::ReadConfirmed);
                    MutationOutcome::Applied
                }
            }
            NoticeMutation::RequirePhysical { at } => match self.physical_track {
                PhysicalTrack::NotRequired if self.recipient_engaged() => {
                    MutationOutcome::Rejected(RejectReason::RecipientEngaged)
                }
                PhysicalTrack::NotRequired => {
                    self.physical_track = PhysicalTrack::Required;
                    self.physical_required_at = Some(*at);
                    self.physical_fallback_required = true;
                    MutationOutcome::Applied
                }
                _ => MutationOutcome::AlreadySet,
            },
            NoticeMutation::PhysicalDispatched { at } => match self.physical_track {
                PhysicalTrack::Required => {
                    self.physical_track = PhysicalTrack::Dispatched;
                    self.physical_dispatched_at = Some(*at);
                    MutationOutcome::Applied
                }
                PhysicalTrack::Dispatched => MutationOutcome::AlreadySet,
                PhysicalTrack::NotRequired => {
                    MutationOutcome::Rejected(RejectReason::MissingPrerequisite)
                }
            },
            NoticeMutation::SyncProof {
                notary_token,
                blockchain,
            } => {
                let token_changed = notary_token.is_some() && self.notary_token.is_none();
                let proof_changed = *blockchain != self.blockchain_proof
                    && !matches!(
                        self.blockchain_proof,
                        ProofState::Confirmed | ProofState::Failed
                    );
                if !token_changed && !proof_changed {
                    MutationOutcome::AlreadySet
                } else {
                    if token_changed {
                        self.notary_token = notary_token.clone();
                    }
                    if proof_changed {
                        self.blockchain_proof = *blockchain;
                    }
                    MutationOutcome::Applied
                }
            }
            NoticeMutation::PromoteFirm { at, basis } => {
                if self.state == LifecycleState::Firm {
                    MutationOutcome::AlreadySet
                } else {
                    let allowed = match basis {
                        FirmBasis::AutoPromoted => {
                            self.state == LifecycleState::ReadConfirmed
                                && self.impugned_at.is_none()
                        }
                        FirmBasis::ImpugnmentDeclined => self.state == LifecycleState::Impugned,
                    };
                    if allowed {
                        self.state = LifecycleState::Firm;
                        self.firm_at = Some(*at);
                        self.firm_basis = Some(*basis);
                        MutationOutcome::Applied
                    } else {
                        MutationOutcome::Rejected(RejectReason::InvalidTransition {
                            from: self.state,
                            to: LifecycleState::Firm,
                        })
                    }
                }
            }
            NoticeMutation::Impugn { at } => {
                if self.impugned_at.is_some() {
                    MutationOutcome::AlreadySet
                } else if self.state.can_transition_to(LifecycleState::Impugned) {
                    self.state = LifecycleState::Impugned;
                    self.impugned_at = Some(*at);
                    MutationOutcome::Applied
                } else {
                    MutationOutcome::Rejected(RejectReason::InvalidTransition {
                        from: self.state,
                        to: LifecycleState::Impugned,
                    })
                }
            }
        };

        if outcome == MutationOutcome::Applied {
            self.version += 1;
        }
        outcome
    }
}

// ---------------------------------------------------------------------------
// Mutations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NoticeMutation {
    Dispatch {
        channel: Channel,
        provider_message_id: ProviderMessageId,
        at: Timestamp,
    },
    Delivered {
        channel: Channel,
        at: Timestamp,
    },
    FirstOpen {
        channel: Channel,
        at: Timestamp,
        source: OpenSource,
    },
    ChannelFailed {
        channel: Channel,
        at: Timestamp,
        reason: String,
    },
    IdentityValidated {
        at: Timestamp,
    },
    CodeValidated {
        at: Timestamp,
    },
    BiometricCompleted {
        at: Timestamp,
        contingency: bool,
    },
    ReadConfirmed {
        at: Timestamp,
        method: ReadMethod,
    },
    RequirePhysical {
        at: Timestamp,
    },
    PhysicalDispatched {
        at: Timestamp,
    },
    SyncProof {
        notary_token: Option<String>,
        blockchain: ProofState,
    },
    PromoteFirm {
        at: Timestamp,
        basis: FirmBasis,
    },
    Impugn {
        at: Timestamp,
    },
}

impl NoticeMutation {
    /// Mutations that write provider-reported delivery facts.
    pub fn touches_delivery_fields(&self) -> bool {
        matches!(
            self,
            NoticeMutation::Dispatch { .. }
                | NoticeMutation::Delivered { .. }
                | NoticeMutation::FirstOpen { .. }
                | NoticeMutation::ChannelFailed { .. }
                | NoticeMutation::RequirePhysical { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationOutcome {
    Applied,
    AlreadySet,
    Rejected(RejectReason),
}

impl MutationOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, MutationOutcome::Applied)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    TerminalState,
    NotDispatched,
    MissingPrerequisite,
    AlreadySigned,
    RecipientEngaged,
    InvalidTransition {
        from: LifecycleState,
        to: LifecycleState,
    },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::TerminalState => f.write_str("notice is in a terminal state"),
            RejectReason::NotDispatched => f.write_str("channel was never dispatched"),
            RejectReason::MissingPrerequisite => f.write_str("prerequisite milestone missing"),
            RejectReason::AlreadySigned => f.write_str("document already signed"),
            RejectReason::RecipientEngaged => f.write_str("recipient already passed a gate"),
            RejectReason::InvalidTransition { from, to } => {
                write!(f, "invalid transition {} -> {}", from, to)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Selection predicates for scheduled jobs
// ---------------------------------------------------------------------------

/// Predicate-selected row sets used by the scheduled jobs. Each job reads a
/// disjoint slice of notices and writes back through conditional mutations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoticeFilter {
    /// Dispatched between the two bounds, no open recorded, not terminal.
    AwaitingOpen {
        dispatched_before: Timestamp,
        dispatched_after: Timestamp,
    },
    /// Dispatched at or before the bound, never opened nor validated through
    /// the gatekeeper, physical track untouched.
    PastSubsidiarityGrace { dispatched_before: Timestamp },
    /// Read-confirmed at or before the bound, never impugned, not yet firm.
    DueForFirmness { read_before: Timestamp },
}

impl NoticeFilter {
    pub fn matches(&self, notice: &Notice) -> bool {
        match self {
            NoticeFilter::AwaitingOpen {
                dispatched_before,
                dispatched_after,
            } => match notice.first_dispatched_at() {
                Some(at) => {
                    at <= *dispatched_before
                        && at >= *dispatched_after
                        && !notice.has_open()
                        && !notice.state.is_terminal()
                }
                None => false,
            },
            NoticeFilter::PastSubsidiarityGrace { dispatched_before } => {
                match notice.first_dispatched_at() {
                    Some(at) => {
                        at <= *dispatched_before
                            && !notice.has_open()
                            && !notice.recipient_engaged()
                            && notice.physical_track == PhysicalTrack::NotRequired
                            && !notice.state.is_terminal()
                    }
                    None => false,
                }
            }
            NoticeFilter::DueForFirmness { read_before } => {
                notice.state == LifecycleState::ReadConfirmed
                    && notice.impugned_at.is_none()
                    && notice
                        .read_confirmed_at
                        .map(|at| at <= *read_before)
                        .unwrap_or(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_content() -> NoticeContent {
        NoticeContent {
            employee_id: EmployeeId::new("emp-1"),
            company_id: CompanyId::new("acme"),
            sanction_type: "Suspension".into(),
            sanction_days: 3,
            incident_date: NaiveDate::from_ymd_opt(2026, 3, 14).unwrap(),
            summary: "Unjustified absence".into(),
            body: "The employee failed to report for duty.".into(),
        }
    }

    fn sample_notice() -> Notice {
        Notice::draft(
            NoticeId::new("n-1"),
            sample_content(),
            ContentHash([7; 32]),
            Timestamp::from_seconds(1_000),
            None,
        )
    }

    fn dispatch(notice: &mut Notice, channel: Channel, at: u64) -> MutationOutcome {
        notice.apply(&NoticeMutation::Dispatch {
            channel,
            provider_message_id: ProviderMessageId::new(format!("msg-{}", channel)),
            at: Timestamp::from_seconds(at),
        })
    }

    #[test]
    fn test_valid_transitions() {
        assert!(LifecycleState::Draft.can_transition_to(LifecycleState::Dispatched));
        assert!(LifecycleState::ReadConfirmed.can_transition_to(LifecycleState::Firm));
        assert!(LifecycleState::Impugned.can_transition_to(LifecycleState::Firm));
        assert!(!LifecycleState::Firm.can_transition_to(LifecycleState::Impugned));
        assert!(!LifecycleState::Draft.can_transition_to(LifecycleState::Firm));
        assert!(!LifecycleState::ReadConfirmed.can_transition_to(LifecycleState::Dispatched));
    }

    #[test]
    fn test_dispatch_advances_state_once() {
        let mut notice = sample_notice();
        assert_eq!(dispatch(&mut notice, Channel::Email, 2_000), MutationOutcome::Applied);
        assert_eq!(notice.state, LifecycleState::Dispatched);
        assert_eq!(dispatch(&mut notice, Channel::Email, 3_000), MutationOutcome::AlreadySet);
        assert_eq!(
            notice.channels[&Channel::Email].dispatched_at,
            Some(Timestamp::from_seconds(2_000))
        );
        assert_eq!(dispatch(&mut notice, Channel::Sms, 2_500), MutationOutcome::Applied);
        assert_eq!(notice.first_dispatched_at(), Some(Timestamp::from_seconds(2_000)));
        assert_eq!(notice.version, 2);
    }

    #[test]
    fn test_first_open_is_one_shot() {
        let mut notice = sample_notice();
        dispatch(&mut notice, Channel::Email, 2_000);
        let open = |at| NoticeMutation::FirstOpen {
            channel: Channel::Email,
            at: Timestamp::from_seconds(at),
            source: OpenSource::Webhook,
        };
        assert_eq!(notice.apply(&open(2_100)), MutationOutcome::Applied);
        let snapshot = notice.clone();
        assert_eq!(notice.apply(&open(2_200)), MutationOutcome::AlreadySet);
        assert_eq!(notice, snapshot);
    }

    #[test]
    fn test_open_on_undispatched_channel_rejected() {
        let mut notice = sample_notice();
        let outcome = notice.apply(&NoticeMutation::FirstOpen {
            channel: Channel::Sms,
            at: Timestamp::from_seconds(5),
            source: OpenSource::Webhook,
        });
        assert_eq!(outcome, MutationOutcome::Rejected(RejectReason::NotDispatched));
        assert!(notice.channels.get(&Channel::Sms).is_none() || !notice.has_open());
    }

    #[test]
    fn test_channel_failure_sets_fallback_flag() {
        let mut notice = sample_notice();
        dispatch(&mut notice, Channel::Email, 2_000);
        let outcome = notice.apply(&NoticeMutation::ChannelFailed {
            channel: Channel::Email,
            at: Timestamp::from_seconds(2_050),
            reason: "bounced".into(),
        });
        assert!(outcome.is_applied());
        assert!(notice.physical_fallback_required);
        assert!(notice.any_channel_failed());
        assert_eq!(notice.physical_track, PhysicalTrack::NotRequired);
    }

    #[test]
    fn test_read_confirmation_is_immutable() {
        let mut notice = sample_notice();
        dispatch(&mut notice, Channel::Email, 2_000);
        notice.apply(&NoticeMutation::IdentityValidated {
            at: Timestamp::from_seconds(3_000),
        });
        let first = notice.apply(&NoticeMutation::ReadConfirmed {
            at: Timestamp::from_seconds(4_000),
            method: ReadMethod::ComprehensionChallenge,
        });
        assert!(first.is_applied());
        assert_eq!(
            notice.expires_at,
            Some(Timestamp::from_seconds(4_000 + FIRMNESS_PERIOD_SECS))
        );
        let second = notice.apply(&NoticeMutation::ReadConfirmed {
            at: Timestamp::from_seconds(9_000),
            method: ReadMethod::Checkbox,
        });
        assert_eq!(second, MutationOutcome::AlreadySet);
        assert_eq!(notice.read_confirmed_at, Some(Timestamp::from_seconds(4_000)));
        assert_eq!(notice.read_method, Some(ReadMethod::ComprehensionChallenge));
        assert_eq!(notice.state, LifecycleState::ReadConfirmed);
    }

    #[test]
    fn test_terminal_notice_rejects_delivery_updates() {
        let mut notice = sample_notice();
        dispatch(&mut notice, Channel::Email, 2_000);
        notice.apply(&NoticeMutation::IdentityValidated {
            at: Timestamp::from_seconds(3_000),
        });
        notice.apply(&NoticeMutation::ReadConfirmed {
            at: Timestamp::from_seconds(4_000),
            method: ReadMethod::Checkbox,
        });
        let promoted = notice.apply(&NoticeMutation::PromoteFirm {
            at: Timestamp::from_seconds(5_000),
            basis: FirmBasis::AutoPromoted,
        });
        assert!(promoted.is_applied());
        let late = notice.apply(&NoticeMutation::Delivered {
            channel: Channel::Email,
            at: Timestamp::from_seconds(6_000),
        });
        assert_eq!(late, MutationOutcome::Rejected(RejectReason::TerminalState));
        assert!(notice.channels[&Channel::Email].delivered_at.is_none());
    }

    #[test]
    fn test_impugned_notice_not_auto_promoted() {
        let mut notice = sample_notice();
        dispatch(&mut notice, Channel::Email, 2_000);
        notice.apply(&NoticeMutation::IdentityValidated {
            at: Timestamp::from_seconds(3_000),
        });
        notice.apply(&NoticeMutation::ReadConfirmed {
            at: Timestamp::from_seconds(4_000),
            method: ReadMethod::Checkbox,
        });
        assert!(notice
            .apply(&NoticeMutation::Impugn {
                at: Timestamp::from_seconds(4_500)
            })
            .is_applied());
        let auto = notice.apply(&NoticeMutation::PromoteFirm {
            at: Timestamp::from_seconds(5_000),
            basis: FirmBasis::AutoPromoted,
        });
        assert!(matches!(auto, MutationOutcome::Rejected(_)));
        let declined = notice.apply(&NoticeMutation::PromoteFirm {
            at: Timestamp::from_seconds(5_000),
            basis: FirmBasis::ImpugnmentDeclined,
        });
        assert!(declined.is_applied());
        assert_eq!(notice.firm_basis, Some(FirmBasis::ImpugnmentDeclined));
    }

    #[test]
    fn test_physical_track_is_one_way() {
        let mut notice = sample_notice();
        let early = notice.apply(&NoticeMutation::PhysicalDispatched {
            at: Timestamp::from_seconds(10),
        });
        assert!(matches!(early, MutationOutcome::Rejected(_)));
        assert!(notice
            .apply(&NoticeMutation::RequirePhysical {
                at: Timestamp::from_seconds(20)
            })
            .is_applied());
        assert_eq!(
            notice.apply(&NoticeMutation::RequirePhysical {
                at: Timestamp::from_seconds(30)
            }),
            MutationOutcome::AlreadySet
        );
        assert!(notice
            .apply(&NoticeMutation::PhysicalDispatched {
                at: Timestamp::from_seconds(40)
            })
            .is_applied());
        assert_eq!(notice.physical_track, PhysicalTrack::Dispatched);
    }

    #[test]
    fn test_physical_requirement_rejected_after_identity_validation() {
        let mut notice = sample_notice();
        dispatch(&mut notice, Channel::Sms, 1_000);
        notice.apply(&NoticeMutation::IdentityValidated {
            at: Timestamp::from_seconds(2_000),
        });
        let outcome = notice.apply(&NoticeMutation::RequirePhysical {
            at: Timestamp::from_seconds(200_000),
        });
        assert_eq!(
            outcome,
            MutationOutcome::Rejected(RejectReason::RecipientEngaged)
        );
        assert_eq!(notice.physical_track, PhysicalTrack::NotRequired);
        assert!(!notice.physical_fallback_required);
    }

    #[test]
    fn test_filters() {
        let mut notice = sample_notice();
        dispatch(&mut notice, Channel::Email, 1_000);
        let awaiting = NoticeFilter::AwaitingOpen {
            dispatched_before: Timestamp::from_seconds(2_000),
            dispatched_after: Timestamp::from_seconds(500),
        };
        assert!(awaiting.matches(&notice));
        let grace = NoticeFilter::PastSubsidiarityGrace {
            dispatched_before: Timestamp::from_seconds(999),
        };
        assert!(!grace.matches(&notice));
        let late = NoticeFilter::PastSubsidiarityGrace {
            dispatched_before: Timestamp::from_seconds(5_000),
        };
        assert!(late.matches(&notice));
        notice.apply(&NoticeMutation::IdentityValidated {
            at: Timestamp::from_seconds(1_500),
        });
        assert!(!late.matches(&notice));
        let firmness = NoticeFilter::DueForFirmness {
            read_before: Timestamp::from_seconds(10_000),
        };
        assert!(!firmness.matches(&notice));
    }
}
