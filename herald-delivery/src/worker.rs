//! Worker loop: claim a recipient, render, send, retry, record.
//!
//! Cancellation is cooperative. A worker looks at the control channel before
//! every claim and before every retry, and every sleep it takes races a stop
//! request. A send already handed to the transport is always awaited.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use herald_common::{audit, internal};
use tokio::{sync::watch, time::Instant};

use crate::{
    attachment::{self, AttachmentIndex},
    campaign::{AttachmentRef, Campaign, DynamicAttachment},
    error::TransportError,
    feed::{Recipient, RecipientFeed},
    log::{AttemptOutcome, AttemptRecord},
    policy::{DomainPolicyResolver, RetryDecision},
    run::state::{Control, RunState},
    sink::EventLevel,
    template,
    transport::{Accepted, DeliverabilityHeaders, OutboundMessage, SenderIdentity, Transport},
};

/// Everything a worker needs, shared by all workers of a run
pub struct WorkerContext {
    pub state: Arc<RunState>,
    pub feed: Arc<RecipientFeed>,
    pub campaign: Arc<Campaign>,
    /// Listing of the dynamic attachment folder, taken when the run starts
    pub attachments: AttachmentIndex,
    pub resolver: DomainPolicyResolver,
    pub transport: Arc<dyn Transport>,
    pub sender: SenderIdentity,
    pub unsubscribe_url: Option<String>,
}

fn current(control: &watch::Receiver<Control>) -> Control {
    *control.borrow()
}

/// Sleep for `duration` unless a stop arrives first. Returns `true` when
/// stopped.
async fn sleep_or_stop(control: &mut watch::Receiver<Control>, duration: Duration) -> bool {
    if duration.is_zero() {
        return current(control) == Control::Stop;
    }

    tokio::select! {
        () = tokio::time::sleep(duration) => false,
        stopped = control.wait_for(|c| *c == Control::Stop) => {
            // A closed channel means the run is gone; treat it as a stop
            drop(stopped);
            true
        }
    }
}

pub async fn run(worker_id: usize, ctx: Arc<WorkerContext>) {
    let mut control = ctx.state.control();
    let mut handled = 0usize;

    internal!("Worker {worker_id} of run {} started", ctx.state.run_id());

    loop {
        match current(&control) {
            Control::Stop => break,
            Control::Pause => {
                if control.wait_for(|c| *c != Control::Pause).await.is_err() {
                    break;
                }
                continue;
            }
            Control::Run => {}
        }

        let Some(recipient) = ctx.feed.next() else {
            break;
        };

        process_recipient(&ctx, &recipient, &mut control).await;
        handled += 1;

        let campaign = &ctx.campaign;
        if campaign.batch_pause_ms > 0
            && handled % campaign.batch_size == 0
            && !ctx.feed.is_exhausted()
            && sleep_or_stop(&mut control, Duration::from_millis(campaign.batch_pause_ms)).await
        {
            break;
        }
    }

    internal!(
        "Worker {worker_id} of run {} exiting after {handled} recipient(s)",
        ctx.state.run_id()
    );
}

async fn process_recipient(
    ctx: &WorkerContext,
    recipient: &Recipient,
    control: &mut watch::Receiver<Control>,
) {
    let run_id = ctx.state.run_id();
    let run_label = run_id.to_string();
    let address = recipient.address.to_string();
    let domain = recipient.address.domain();
    let policy = ctx.resolver.resolve(&domain);

    let content = template::render(&ctx.campaign.template, recipient);
    let attachments = attachments_for(ctx, recipient).await;

    let mut try_number = 0u32;
    loop {
        try_number += 1;

        if sleep_or_stop(control, policy.inter_send_delay).await {
            return;
        }

        let headers = DeliverabilityHeaders::build(
            &ctx.sender,
            &recipient.address,
            ctx.campaign.id,
            Some(run_id),
            ctx.unsubscribe_url.as_deref(),
        );
        let message = OutboundMessage::new(
            ctx.sender.clone(),
            recipient.address.clone(),
            content.clone(),
            attachments.clone(),
            headers,
        );

        audit::log_delivery_attempt(&run_label, &address, &domain, try_number);
        let started = Instant::now();
        let result = ctx.transport.send(&message).await;

        let attempt = |outcome, error: Option<String>| AttemptRecord {
            run_id,
            campaign_id: ctx.campaign.id,
            recipient: address.clone(),
            try_number,
            outcome,
            timestamp: Utc::now(),
            error,
            provider_id: None,
            next_retry_ms: None,
        };

        match result {
            Ok(Accepted { provider_id }) => {
                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = started.elapsed().as_millis() as u64;
                audit::log_delivery_success(
                    &run_label,
                    &address,
                    provider_id.as_deref(),
                    try_number,
                    duration_ms,
                );
                let mut record = attempt(AttemptOutcome::Success, None);
                record.provider_id = provider_id;
                ctx.state.record(record).await;
                return;
            }
            Err(TransportError::Permanent(e)) => {
                let error = e.to_string();
                audit::log_delivery_failure(&run_label, &address, &error, try_number, true);
                ctx.state
                    .record(attempt(AttemptOutcome::PermanentFailure, Some(error)))
                    .await;
                return;
            }
            Err(TransportError::Fatal(e)) => {
                // Not the recipient's fault: leave it uncounted so a later
                // run picks it up again
                let error = e.to_string();
                audit::log_delivery_failure(&run_label, &address, &error, try_number, false);
                ctx.state
                    .record(attempt(AttemptOutcome::TransientFailure, Some(error.clone())))
                    .await;
                ctx.state.notice(EventLevel::Error, format!("Transport failure: {error}"));
                ctx.state.fault(error);
                return;
            }
            Err(TransportError::Transient(e)) => {
                let error = e.to_string();
                match policy.retry.decide(try_number) {
                    RetryDecision::GiveUp => {
                        audit::log_delivery_failure(&run_label, &address, &error, try_number, true);
                        let error = format!("{error} (gave up after {try_number} tries)");
                        ctx.state
                            .record(attempt(AttemptOutcome::PermanentFailure, Some(error)))
                            .await;
                        return;
                    }
                    RetryDecision::RetryAfter(delay) => {
                        audit::log_delivery_failure(&run_label, &address, &error, try_number, false);
                        let mut record = attempt(AttemptOutcome::TransientFailure, Some(error));
                        #[allow(clippy::cast_possible_truncation)]
                        let delay_ms = delay.as_millis() as u64;
                        record.next_retry_ms = Some(delay_ms);
                        ctx.state.record(record).await;

                        if current(control) == Control::Stop || sleep_or_stop(control, delay).await {
                            internal!(
                                level = DEBUG,
                                "Retry chain for {address} interrupted by stop after try {try_number}"
                            );
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Fixed attachments plus the recipient's dynamic one, when one is found
async fn attachments_for(ctx: &WorkerContext, recipient: &Recipient) -> Vec<AttachmentRef> {
    let mut attachments = ctx.campaign.attachments.clone();

    let Some(dynamic) = &ctx.campaign.dynamic_attachment else {
        return attachments;
    };

    match find_dynamic(ctx, dynamic, recipient).await {
        Some(found) => attachments.push(found),
        None => ctx.state.notice(
            EventLevel::Warning,
            format!(
                "No attachment for {} in '{}', sending without it",
                recipient.address,
                dynamic.folder.display()
            ),
        ),
    }

    attachments
}

/// Rendered pattern first, exact then ignoring case; the name index last.
///
/// A rendered filename must stay inside the configured folder.
async fn find_dynamic(
    ctx: &WorkerContext,
    dynamic: &DynamicAttachment,
    recipient: &Recipient,
) -> Option<AttachmentRef> {
    if let Some(pattern) = &dynamic.pattern {
        let filename = template::substitute(pattern, &recipient.variables);

        if filename.trim().is_empty()
            || filename.contains('/')
            || filename.contains('\\')
            || filename.contains("..")
        {
            ctx.state.notice(
                EventLevel::Warning,
                format!(
                    "Refusing dynamic attachment name '{filename}' for {}",
                    recipient.address
                ),
            );
        } else {
            let path = dynamic.folder.join(&filename);
            if matches!(tokio::fs::try_exists(&path).await, Ok(true)) {
                return Some(AttachmentRef::new(filename, path));
            }
            if let Some(file) = ctx.attachments.find_ignoring_case(&filename) {
                return Some(AttachmentRef::new(file.filename.clone(), file.path.clone()));
            }
        }
    }

    let name = attachment::recipient_name(&recipient.variables, dynamic.name_column.as_deref())?;
    let file = ctx.attachments.find_by_name(name)?;
    internal!(
        level = DEBUG,
        "Matched attachment '{}' to {} by name",
        file.filename,
        recipient.address
    );
    Some(AttachmentRef::new(file.filename.clone(), file.path.clone()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::{
        campaign::{Mode, RecipientRow},
        log::{AttemptLog, MemoryAttemptLog},
        policy::{DomainThrottleRegistry, RetryPolicy},
        run::RunId,
        sink::Event,
        template::Template,
        transport::ScriptedTransport,
    };

    async fn context(campaign: Campaign, rows: &[RecipientRow]) -> Arc<WorkerContext> {
        let (feed, _) = RecipientFeed::build(&campaign, rows, &HashSet::new());
        let feed = Arc::new(feed);
        let log: Arc<dyn AttemptLog> = Arc::new(MemoryAttemptLog::new());
        let state = Arc::new(RunState::new(
            RunId::generate(),
            campaign.id,
            Arc::clone(&feed),
            log,
            16,
        ));
        let attachments = match &campaign.dynamic_attachment {
            Some(dynamic) => AttachmentIndex::build(&dynamic.folder).await,
            None => AttachmentIndex::default(),
        };

        Arc::new(WorkerContext {
            state,
            feed,
            resolver: DomainPolicyResolver::new(DomainThrottleRegistry::new(), RetryPolicy::default()),
            campaign: Arc::new(campaign),
            attachments,
            transport: Arc::new(ScriptedTransport::default()),
            sender: SenderIdentity::default(),
            unsubscribe_url: None,
        })
    }

    fn real_campaign() -> Campaign {
        let mut campaign = Campaign::new("w", Template::new("s", "<p>b</p>"));
        campaign.mode = Mode::Real;
        campaign
    }

    fn with_folder(folder: &std::path::Path, pattern: Option<&str>) -> Campaign {
        let mut campaign = real_campaign();
        campaign.dynamic_attachment = Some(DynamicAttachment {
            folder: folder.to_path_buf(),
            pattern: pattern.map(str::to_string),
            name_column: None,
        });
        campaign
    }

    #[tokio::test]
    async fn test_dynamic_attachment_found_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Invite Ann.pdf"), b"%PDF").unwrap();

        let rows = [
            RecipientRow::new("ann@example.com").with_variable("name", "Ann"),
            RecipientRow::new("bob@example.com").with_variable("name", "Bob"),
        ];
        let ctx = context(with_folder(dir.path(), Some("Invite {{name}}.pdf")), &rows).await;
        let mut events = ctx.state.subscribe();

        let ann = ctx.feed.next().unwrap();
        let found = attachments_for(&ctx, &ann).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].filename, "Invite Ann.pdf");
        assert_eq!(found[0].content_type(), "application/pdf");

        let bob = ctx.feed.next().unwrap();
        assert!(attachments_for(&ctx, &bob).await.is_empty());
        assert!(matches!(
            events.next().await,
            Some(Event::Notice { level: EventLevel::Warning, .. })
        ));
    }

    #[tokio::test]
    async fn test_dynamic_attachment_ignores_case() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("invite ANN.PDF"), b"%PDF").unwrap();

        let rows = [RecipientRow::new("ann@example.com").with_variable("name", "Ann")];
        let ctx = context(with_folder(dir.path(), Some("Invite {{name}}.pdf")), &rows).await;

        let ann = ctx.feed.next().unwrap();
        let found = attachments_for(&ctx, &ann).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].filename, "invite ANN.PDF");
        assert_eq!(found[0].path, dir.path().join("invite ANN.PDF"));
    }

    #[tokio::test]
    async fn test_dynamic_attachment_by_name_words() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Invitación Ana María Ruiz.pdf"), b"%PDF").unwrap();
        std::fs::write(dir.path().join("Smith Ann Invitation.pdf"), b"%PDF").unwrap();

        let rows = [
            RecipientRow::new("ana@example.com").with_variable("Nombre", "ana ruiz"),
            RecipientRow::new("ann@example.com").with_variable("Nombre", "Ann Smith"),
        ];

        // No pattern at all: the name column decides
        let ctx = context(with_folder(dir.path(), None), &rows).await;
        let ana = ctx.feed.next().unwrap();
        let found = attachments_for(&ctx, &ana).await;
        assert_eq!(found[0].filename, "Invitación Ana María Ruiz.pdf");

        // A pattern that misses falls back to the name
        let ctx = context(with_folder(dir.path(), Some("Invite {{Nombre}}.pdf")), &rows).await;
        ctx.feed.next().unwrap();
        let ann = ctx.feed.next().unwrap();
        let found = attachments_for(&ctx, &ann).await;
        assert_eq!(found[0].filename, "Smith Ann Invitation.pdf");
    }

    #[tokio::test]
    async fn test_dynamic_attachment_rejects_traversal() {
        let rows = [RecipientRow::new("eve@example.com").with_variable("name", "../etc/passwd")];
        let ctx = context(
            with_folder(std::path::Path::new("/srv/attachments"), Some("{{name}}")),
            &rows,
        )
        .await;
        let eve = ctx.feed.next().unwrap();
        assert!(attachments_for(&ctx, &eve).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_or_stop_wakes_on_stop() {
        let ctx = context(real_campaign(), &[]).await;
        let mut control = ctx.state.control();

        let state = Arc::clone(&ctx.state);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            state.request(Control::Stop);
        });

        let started = Instant::now();
        assert!(sleep_or_stop(&mut control, Duration::from_secs(3600)).await);
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
