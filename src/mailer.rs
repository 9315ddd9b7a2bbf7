//! Outbound mail seam. Delivery itself lives outside this crate; the engine
//! only says what happened and to whom.

use async_trait::async_trait;
use tracing::info;

use crate::model::{BookingView, RescheduleRequest, User};

#[async_trait]
pub trait Mailer: Send + Sync {
    /// A booking was committed. Sent to both participants.
    async fn booking_created(&self, view: &BookingView);

    /// `recipient` is asked to accept or decline.
    async fn reschedule_proposed(&self, request: &RescheduleRequest, recipient: &User);

    /// `recipient` proposed the change and learns the outcome.
    async fn reschedule_resolved(&self, request: &RescheduleRequest, recipient: &User);
}

/// Writes every message to the log instead of sending it.
#[derive(Debug, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn booking_created(&self, view: &BookingView) {
        info!(
            booking = %view.booking.id,
            class = %view.class_title,
            "mail: booking created for {} with {}",
            view.student_name,
            view.tutor_name
        );
    }

    async fn reschedule_proposed(&self, request: &RescheduleRequest, recipient: &User) {
        info!(
            request = %request.id,
            booking = %request.booking_id,
            "mail: reschedule proposed to {} <{}>",
            recipient.name,
            recipient.email
        );
    }

    async fn reschedule_resolved(&self, request: &RescheduleRequest, recipient: &User) {
        info!(
            request = %request.id,
            status = request.status.as_str(),
            "mail: reschedule resolved for {} <{}>",
            recipient.name,
            recipient.email
        );
    }
}
