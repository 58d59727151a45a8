use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::voucher::error::VoucherError;
use crate::voucher::payload::Payload;
use crate::voucher::time_utils::is_past;

/// The five redeemable voucher kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoucherKind {
    /// Free-entry ticket
    Ticket,
    /// Point-reward redemption
    Points,
    /// Event registration
    Event,
    /// Paid tourism-ticket booking
    Tourism,
    /// Promotional benefit grant
    Benefit,
}

impl VoucherKind {
    /// Order in which code-based redemption probes the kinds.
    pub const REDEMPTION_ORDER: [VoucherKind; 5] = [
        VoucherKind::Ticket,
        VoucherKind::Points,
        VoucherKind::Event,
        VoucherKind::Tourism,
        VoucherKind::Benefit,
    ];

    /// The payload `type` discriminator.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ticket => "ticket",
            Self::Points => "points",
            Self::Event => "event",
            Self::Tourism => "tourism",
            Self::Benefit => "benefit",
        }
    }

    /// Human-readable kind name printed on proofs and history rows.
    pub fn display_label(&self) -> &'static str {
        match self {
            Self::Ticket => "Free Entry Ticket",
            Self::Points => "Point Reward",
            Self::Event => "Event Registration",
            Self::Tourism => "Tourism Ticket",
            Self::Benefit => "Promo Benefit",
        }
    }

    /// Payload key carrying the kind-specific voucher id.
    pub fn id_field(&self) -> &'static str {
        match self {
            Self::Ticket => "ticketId",
            Self::Points => "redemptionId",
            Self::Event => "registrationId",
            Self::Tourism => "bookingId",
            Self::Benefit => "benefitRedemptionId",
        }
    }

    /// Whether vouchers of this kind can be redeemed by scanning their QR token.
    ///
    /// Tourism bookings and benefits are only redeemable by code.
    pub fn accepts_qr(&self) -> bool {
        matches!(self, Self::Ticket | Self::Points | Self::Event)
    }

    /// Status a freshly issued voucher of this kind starts in.
    pub fn initial_status(&self) -> VoucherStatus {
        match self {
            Self::Points | Self::Tourism => VoucherStatus::Pending,
            Self::Ticket | Self::Event | Self::Benefit => VoucherStatus::Active,
        }
    }
}

impl fmt::Display for VoucherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VoucherKind {
    type Err = VoucherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ticket" => Ok(Self::Ticket),
            "points" => Ok(Self::Points),
            "event" => Ok(Self::Event),
            "tourism" => Ok(Self::Tourism),
            "benefit" => Ok(Self::Benefit),
            other => Err(VoucherError::DecodeError(format!(
                "unknown voucher type '{other}'"
            ))),
        }
    }
}

/// Redemption-relevant status of a voucher.
///
/// Ticket, point, event and benefit vouchers move `ACTIVE`/`PENDING` → `REDEEMED`.
/// Tourism bookings carry their payment state here (`PENDING`, `PAID`, …) and
/// record redemption only through `redeemed_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VoucherStatus {
    Active,
    Pending,
    Paid,
    Cancelled,
    Expired,
    Redeemed,
}

impl VoucherStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Pending => "PENDING",
            Self::Paid => "PAID",
            Self::Cancelled => "CANCELLED",
            Self::Expired => "EXPIRED",
            Self::Redeemed => "REDEEMED",
        }
    }
}

impl fmt::Display for VoucherStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VoucherStatus {
    type Err = VoucherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(Self::Active),
            "PENDING" => Ok(Self::Pending),
            "PAID" => Ok(Self::Paid),
            "CANCELLED" => Ok(Self::Cancelled),
            "EXPIRED" => Ok(Self::Expired),
            "REDEEMED" => Ok(Self::Redeemed),
            other => Err(VoucherError::from_database_message(format!(
                "unknown voucher status '{other}'"
            ))),
        }
    }
}

/// Kind-specific descriptive fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum VoucherDetails {
    Ticket {
        ticket_name: String,
        /// Unix seconds; shown to the member, not enforced unless configured
        valid_date: Option<i64>,
    },
    Points {
        reward_name: String,
        points_cost: u64,
    },
    Event {
        event_id: String,
        event_name: String,
    },
    Tourism {
        destination: String,
        quantity: u32,
        visit_date: Option<i64>,
        payment_ref: Option<String>,
    },
    Benefit {
        benefit_name: String,
        promo_id: String,
        promo_ends_at: Option<i64>,
    },
}

impl VoucherDetails {
    pub fn kind(&self) -> VoucherKind {
        match self {
            Self::Ticket { .. } => VoucherKind::Ticket,
            Self::Points { .. } => VoucherKind::Points,
            Self::Event { .. } => VoucherKind::Event,
            Self::Tourism { .. } => VoucherKind::Tourism,
            Self::Benefit { .. } => VoucherKind::Benefit,
        }
    }
}

/// A redeemable voucher of any kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Voucher {
    /// Kind-specific identifier (ticket id, booking id, …)
    pub id: String,
    /// Owning member
    pub member_id: String,
    pub status: VoucherStatus,
    /// Unix seconds; `None` until redeemed
    pub redeemed_at: Option<i64>,
    /// Integrity tag stored at issuance
    pub tag: Option<String>,
    /// Friendly code stored at issuance; legacy records have none
    pub friendly_code: Option<String>,
    pub details: VoucherDetails,
}

impl Voucher {
    /// Creates an unissued voucher in its kind's initial status.
    pub fn new(id: impl Into<String>, member_id: impl Into<String>, details: VoucherDetails) -> Self {
        Self {
            id: id.into(),
            member_id: member_id.into(),
            status: details.kind().initial_status(),
            redeemed_at: None,
            tag: None,
            friendly_code: None,
            details,
        }
    }

    pub fn with_status(mut self, status: VoucherStatus) -> Self {
        self.status = status;
        self
    }

    pub fn kind(&self) -> VoucherKind {
        self.details.kind()
    }

    /// Name shown to staff and printed on the proof.
    pub fn label(&self) -> &str {
        match &self.details {
            VoucherDetails::Ticket { ticket_name, .. } => ticket_name,
            VoucherDetails::Points { reward_name, .. } => reward_name,
            VoucherDetails::Event { event_name, .. } => event_name,
            VoucherDetails::Tourism { destination, .. } => destination,
            VoucherDetails::Benefit { benefit_name, .. } => benefit_name,
        }
    }

    /// The event this registration belongs to.
    pub fn event_id(&self) -> Option<&str> {
        match &self.details {
            VoucherDetails::Event { event_id, .. } => Some(event_id),
            _ => None,
        }
    }

    /// Display-time validity deadline, if the kind has one.
    pub fn expires_at(&self) -> Option<i64> {
        match &self.details {
            VoucherDetails::Ticket { valid_date, .. } => *valid_date,
            VoucherDetails::Tourism { visit_date, .. } => *visit_date,
            VoucherDetails::Benefit { promo_ends_at, .. } => *promo_ends_at,
            VoucherDetails::Points { .. } | VoucherDetails::Event { .. } => None,
        }
    }

    /// The canonical payload this voucher is signed over.
    pub fn payload(&self) -> Payload {
        let kind = self.kind();
        let payload = Payload::new(kind.as_str()).with("memberId", self.member_id.as_str());
        let payload = match &self.details {
            VoucherDetails::Event { event_id, .. } => payload.with("eventId", event_id.as_str()),
            _ => payload,
        };
        payload.with(kind.id_field(), self.id.as_str())
    }

    pub fn is_redeemed(&self) -> bool {
        match self.kind() {
            VoucherKind::Tourism => self.redeemed_at.is_some(),
            _ => self.status == VoucherStatus::Redeemed || self.redeemed_at.is_some(),
        }
    }

    /// Checks that the voucher may be redeemed at `now`.
    ///
    /// `AlreadyRedeemed` takes precedence over any kind-specific precondition.
    pub fn ensure_redeemable(&self, now: i64, enforce_expiry: bool) -> Result<(), VoucherError> {
        if self.is_redeemed() {
            return Err(VoucherError::AlreadyRedeemed);
        }

        match self.kind() {
            VoucherKind::Tourism if self.status != VoucherStatus::Paid => {
                return Err(VoucherError::NotRedeemable(format!(
                    "booking payment status is {}",
                    self.status
                )));
            }
            VoucherKind::Tourism => {}
            _ if !matches!(self.status, VoucherStatus::Active | VoucherStatus::Pending) => {
                return Err(VoucherError::NotRedeemable(format!(
                    "voucher status is {}",
                    self.status
                )));
            }
            _ => {}
        }

        if enforce_expiry {
            if let Some(deadline) = self.expires_at().filter(|d| is_past(*d, now)) {
                return Err(VoucherError::NotRedeemable(format!(
                    "voucher expired at {deadline}"
                )));
            }
        }

        Ok(())
    }

    /// Applies the one-way transition locally.
    ///
    /// Tourism bookings keep their payment status.
    pub fn mark_redeemed(&mut self, at: i64) {
        if self.kind() != VoucherKind::Tourism {
            self.status = VoucherStatus::Redeemed;
        }
        self.redeemed_at = Some(at);
    }
}

/// Member owning vouchers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: String,
    pub name: String,
    pub email: Option<String>,
}

impl Member {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            email: None,
        }
    }
}

/// Staff member performing a redemption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaffMember {
    pub id: String,
    pub name: String,
}

impl StaffMember {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Outcome of a successful redemption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedemptionResult {
    /// The voucher after the transition
    pub voucher: Voucher,
    pub voucher_kind: VoucherKind,
    pub voucher_id: String,
    pub member_id: String,
    pub member_name: String,
    pub voucher_label: String,
    pub redeemed_at: i64,
    /// `None` if proof generation failed after the voucher was consumed
    pub proof_url: Option<String>,
    /// `None` if the history row could not be written
    pub history_id: Option<String>,
}
