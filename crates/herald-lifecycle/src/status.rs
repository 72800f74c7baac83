//! Status view served to the issuing party and the accessor.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use herald_core::{
    Channel, ChannelDelivery, FirmBasis, LifecycleState, Notice, NoticeId, PhysicalTrack,
    ProofState, ReadMethod, Timestamp,
};

use crate::semaphore::{derive_semaphore, Semaphore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Milestones {
    pub created_at: Timestamp,
    pub first_dispatched_at: Option<Timestamp>,
    pub first_opened_at: Option<Timestamp>,
    pub identity_validated_at: Option<Timestamp>,
    pub code_validated_at: Option<Timestamp>,
    pub biometric_completed_at: Option<Timestamp>,
    pub biometric_contingency: bool,
    pub read_confirmed_at: Option<Timestamp>,
    pub read_method: Option<ReadMethod>,
    pub expires_at: Option<Timestamp>,
    pub impugned_at: Option<Timestamp>,
    pub firm_at: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoticeStatus {
    pub notice_id: NoticeId,
    pub state: LifecycleState,
    pub semaphore: Semaphore,
    pub firm_basis: Option<FirmBasis>,
    pub milestones: Milestones,
    pub channels: BTreeMap<Channel, ChannelDelivery>,
    pub physical_track: PhysicalTrack,
    pub physical_fallback_required: bool,
    pub physical_required_at: Option<Timestamp>,
    pub physical_dispatched_at: Option<Timestamp>,
    pub blockchain_proof: ProofState,
    pub notary_token_present: bool,
    pub evaluated_at: Timestamp,
}

/// Build the view. The semaphore is derived against `now` every time.
pub fn status_view(notice: &Notice, now: Timestamp) -> NoticeStatus {
    NoticeStatus {
        notice_id: notice.id.clone(),
        state: notice.state,
        semaphore: derive_semaphore(notice, now),
        firm_basis: notice.firm_basis,
        milestones: Milestones {
            created_at: notice.created_at,
            first_dispatched_at: notice.first_dispatched_at(),
            first_opened_at: notice.first_opened_at(),
            identity_validated_at: notice.identity_validated_at,
            code_validated_at: notice.code_validated_at,
            biometric_completed_at: notice.biometric_completed_at,
            biometric_contingency: notice.biometric_contingency,
            read_confirmed_at: notice.read_confirmed_at,
            read_method: notice.read_method,
            expires_at: notice.expires_at,
            impugned_at: notice.impugned_at,
            firm_at: notice.firm_at,
        },
        channels: notice.channels.clone(),
        physical_track: notice.physical_track,
        physical_fallback_required: notice.physical_fallback_required,
        physical_required_at: notice.physical_required_at,
        physical_dispatched_at: notice.physical_dispatched_at,
        blockchain_proof: notice.blockchain_proof,
        notary_token_present: notice.notary_token.is_some(),
        evaluated_at: now,
    }
}
