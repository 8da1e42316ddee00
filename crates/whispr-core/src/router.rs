//! Executes one [`Intent`] per inbound envelope.
//!
//! Graph mutations go to the [`GraphStore`]; replies, notifications and post
//! fan-out go out through the [`Transport`] with bounded retries. Every
//! user-facing failure becomes a chat reply; nothing here returns an error to
//! the worker loop.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::{
    domain::UserId,
    errors::{Error, InvalidIntent},
    graph::{Change, GraphStore, InviteOutcome},
    intent::{self, Intent},
    messaging::{
        port::Transport,
        retry::{send_with_retry, Delivery, FanoutReport, RetryPolicy},
        types::{Envelope, OutboundMessage},
    },
    security::AdminGate,
    utils::{join_labels, truncate_text},
    Result,
};

pub const WELCOME_TEXT: &str = "welcome to whispr, a social network that runs on signal. \
text /help to see commands, /name to pick a name, or /stop to stop receiving messages";

pub const NOT_ADMIN_TEXT: &str = "you must be an admin to use this command";

const INTERNAL_ERROR_TEXT: &str = "something went wrong on our end, please try again later";

#[derive(Clone, Copy, Debug, Default)]
pub struct RouterConfig {
    pub retry: RetryPolicy,
}

/// What handling one envelope did.
#[derive(Clone, Debug, Default)]
pub struct Handled {
    /// `None` for ignored envelopes (group messages).
    pub intent: Option<Intent>,
    /// Set for posts and broadcasts.
    pub fanout: Option<FanoutReport>,
}

#[derive(Debug, Default)]
struct Outcome {
    reply: Option<String>,
    fanout: Option<FanoutReport>,
}

impl Outcome {
    fn reply(text: impl Into<String>) -> Self {
        Self {
            reply: Some(text.into()),
            fanout: None,
        }
    }

    fn silent() -> Self {
        Self::default()
    }
}

pub struct Router {
    store: Arc<GraphStore>,
    transport: Arc<dyn Transport>,
    admins: AdminGate,
    cfg: RouterConfig,
    shutdown: CancellationToken,
}

impl Router {
    pub fn new(
        store: Arc<GraphStore>,
        transport: Arc<dyn Transport>,
        admins: AdminGate,
        cfg: RouterConfig,
    ) -> Self {
        Self {
            store,
            transport,
            admins,
            cfg,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token cancelled by the admin `/shutdown` command.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn store(&self) -> &Arc<GraphStore> {
        &self.store
    }

    /// Interpret and execute one envelope, including all fan-out sends.
    pub async fn handle(&self, envelope: &Envelope) -> Handled {
        if envelope.is_group() {
            tracing::debug!(sender = %envelope.sender, "ignoring group message");
            return Handled::default();
        }
        let sender = &envelope.sender;

        match self.store.ensure_user(sender).await {
            Ok(true) => {
                tracing::info!(user = %sender, "new user");
                self.reply(sender, WELCOME_TEXT).await;
            }
            Ok(false) => {}
            Err(e) => tracing::error!(user = %sender, "failed to record user: {e}"),
        }

        let intent = intent::interpret(envelope);
        tracing::info!(
            sender = %sender,
            intent = intent.kind(),
            text = %truncate_text(&envelope.text, 80),
            "handling envelope"
        );

        if intent.requires_admin() && !self.admins.is_admin(sender) {
            tracing::warn!(sender = %sender, intent = intent.kind(), "{}", Error::Unauthorized);
            self.reply(sender, NOT_ADMIN_TEXT).await;
            return Handled {
                intent: Some(intent),
                fanout: None,
            };
        }

        let outcome = match self.execute(sender, envelope, &intent).await {
            Ok(outcome) => outcome,
            Err(Error::InvalidIntent(e)) => Outcome::reply(e.to_string()),
            Err(e) => {
                tracing::error!(sender = %sender, intent = intent.kind(), "intent failed: {e}");
                Outcome::reply(INTERNAL_ERROR_TEXT)
            }
        };

        if let Some(text) = outcome.reply {
            self.reply(sender, text).await;
        }

        Handled {
            intent: Some(intent),
            fanout: outcome.fanout,
        }
    }

    async fn execute(
        &self,
        sender: &UserId,
        envelope: &Envelope,
        intent: &Intent,
    ) -> Result<Outcome> {
        match intent {
            Intent::Post(text) => self.post(sender, text, envelope.timestamp).await,
            Intent::Follow(target) => self.follow(sender, target).await,
            Intent::Unfollow(target) => {
                let label = self.store.label(target).await;
                Ok(match self.store.unfollow(sender, target).await? {
                    Change::Applied => Outcome::reply(format!("unfollowed {label}")),
                    Change::Unchanged => Outcome::reply(format!("you aren't following {label}")),
                })
            }
            Intent::Invite(target) => self.invite(sender, target).await,
            Intent::AcceptInvite(inviter) => {
                self.store.accept_invite(sender, inviter).await?;
                let me = self.store.label(sender).await;
                let notice = format!("{me} accepted your invite and is now following you");
                self.notify(sender, inviter, notice).await;
                let label = self.store.label(inviter).await;
                Ok(Outcome::reply(format!("followed {label}")))
            }
            Intent::DeclineInvite(inviter) => {
                self.store.decline_invite(sender, inviter).await?;
                let label = self.store.label(inviter).await;
                Ok(Outcome::reply(format!("didn't follow {label}")))
            }
            Intent::Block(target) => {
                let label = self.store.label(target).await;
                Ok(match self.store.block(sender, target).await? {
                    Change::Applied => Outcome::reply(format!(
                        "blocked {label}. you won't receive their posts"
                    )),
                    Change::Unchanged => Outcome::reply(format!("you already blocked {label}")),
                })
            }
            Intent::Unblock(target) => {
                let label = self.store.label(target).await;
                Ok(match self.store.unblock(sender, target).await? {
                    Change::Applied => Outcome::reply(format!("unblocked {label}")),
                    Change::Unchanged => Outcome::reply(format!("{label} wasn't blocked")),
                })
            }
            Intent::RemoveFollower(target) => {
                let label = self.store.label(target).await;
                Ok(match self.store.remove_follower(sender, target).await? {
                    Change::Applied => Outcome::reply(format!("softblocked {label}")),
                    Change::Unchanged => Outcome::reply(format!("{label} isn't following you")),
                })
            }
            Intent::ListFollowers => {
                let ids = self.record_or_empty(sender).await.followers;
                if ids.is_empty() {
                    return Ok(Outcome::reply("you don't have any followers"));
                }
                Ok(Outcome::reply(self.labels(ids).await))
            }
            Intent::ListFollowing => {
                let ids = self.record_or_empty(sender).await.following;
                if ids.is_empty() {
                    return Ok(Outcome::reply("you aren't following anyone"));
                }
                Ok(Outcome::reply(self.labels(ids).await))
            }
            Intent::SetName(name) => {
                self.store.set_name(sender, name).await?;
                Ok(Outcome::reply(format!("other users will now see you as {}", name.trim())))
            }
            Intent::OptOut => Ok(match self.store.set_opted_out(sender, true).await? {
                Change::Applied => {
                    Outcome::reply("i'll stop messaging you. text /start to resume messages")
                }
                Change::Unchanged => {
                    Outcome::reply("you already stopped messages. text /start to resume")
                }
            }),
            Intent::OptIn => Ok(match self.store.set_opted_out(sender, false).await? {
                Change::Applied => Outcome::reply("welcome back"),
                Change::Unchanged => Outcome::reply("you weren't stopped"),
            }),
            Intent::Echo(text) => Ok(Outcome::reply(text.clone())),
            Intent::Help(None) => Ok(Outcome::reply(intent::help_text())),
            Intent::Help(Some(verb)) => Ok(Outcome::reply(match intent::help_for(verb) {
                Some(usage) => usage.to_string(),
                None => format!("no such command '{verb}'"),
            })),
            Intent::AdminBroadcast(text) => self.broadcast(sender, text, envelope.timestamp).await,
            Intent::AdminForceInvite(target) => self.force_invite(sender, target).await,
            Intent::AdminInspect(target) => Ok(Outcome::reply(self.inspect(target).await)),
            Intent::AdminShutdown => {
                tracing::warn!(admin = %sender, "shutdown requested");
                self.reply(sender, "shutting down").await;
                self.shutdown.cancel();
                Ok(Outcome::silent())
            }
            Intent::Unknown { verb } => Ok(Outcome::reply(match intent::command_info(verb) {
                Some(cmd) => format!("usage: {}", cmd.usage),
                None => format!("no such command '{verb}'. text /help to see commands"),
            })),
        }
    }

    async fn follow(&self, sender: &UserId, target: &UserId) -> Result<Outcome> {
        let label = self.store.label(target).await;
        match self.store.follow(sender, target).await? {
            Change::Applied => {
                let me = self.store.label(sender).await;
                self.notify(sender, target, format!("{me} has followed you")).await;
                Ok(Outcome::reply(format!("followed {label}")))
            }
            Change::Unchanged => Ok(Outcome::reply(format!("you're already following {label}"))),
        }
    }

    async fn invite(&self, sender: &UserId, target: &UserId) -> Result<Outcome> {
        let label = self.store.label(target).await;
        match self.store.invite(sender, target).await? {
            InviteOutcome::Invited => {
                let me = self.store.label(sender).await;
                self.notify(
                    sender,
                    target,
                    format!(
                        "{me} invited you to follow them on whispr. \
                         text /accept {sender} to accept or /decline {sender} to ignore"
                    ),
                )
                .await;
                Ok(Outcome::reply(format!("invited {label}")))
            }
            InviteOutcome::AlreadyInvited => {
                Ok(Outcome::reply(format!("you already invited {label}")))
            }
            InviteOutcome::AlreadyFollowing => {
                Ok(Outcome::reply(format!("{label} is already following you")))
            }
        }
    }

    /// Admin shortcut: `target` follows `sender` with no invite round trip.
    async fn force_invite(&self, sender: &UserId, target: &UserId) -> Result<Outcome> {
        if sender == target {
            return Err(InvalidIntent::SelfInvite.into());
        }
        let label = self.store.label(target).await;
        match self.store.follow(target, sender).await? {
            Change::Applied => {
                let me = self.store.label(sender).await;
                self.notify(sender, target, format!("you are now following {me}"))
                    .await;
                Ok(Outcome::reply(format!("{label} is now following you")))
            }
            Change::Unchanged => Ok(Outcome::reply(format!("{label} is already following you"))),
        }
    }

    /// Deliver a post to every follower who hasn't blocked the sender or
    /// opted out. Deliveries are independent of each other.
    async fn post(&self, sender: &UserId, text: &str, timestamp: i64) -> Result<Outcome> {
        if text.is_empty() {
            return Ok(Outcome::silent());
        }
        let author = self.record_or_empty(sender).await;

        let mut recipients = Vec::new();
        for follower in &author.followers {
            let Some(rec) = self.store.get(follower).await else {
                continue;
            };
            if rec.has_blocked(sender) || rec.opted_out {
                continue;
            }
            recipients.push(rec.id);
        }

        if recipients.is_empty() {
            return Ok(Outcome::reply(
                "no one is following you yet. text /invite [number] to invite someone",
            ));
        }

        let body = format!("{}: {text}", author.label());
        let report = self
            .fan_out(&recipients, &body, &format!("post:{sender}:{timestamp}"))
            .await;

        tracing::info!(
            sender = %sender,
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "post fan-out finished"
        );
        Ok(Outcome {
            reply: None,
            fanout: Some(report),
        })
    }

    async fn broadcast(&self, sender: &UserId, text: &str, timestamp: i64) -> Result<Outcome> {
        let mut recipients = Vec::new();
        for id in self.store.known_users().await {
            if &id == sender {
                continue;
            }
            match self.store.get(&id).await {
                Some(rec) if !rec.opted_out => recipients.push(id),
                _ => {}
            }
        }

        let report = self
            .fan_out(
                &recipients,
                &format!("[broadcast] {text}"),
                &format!("broadcast:{sender}:{timestamp}"),
            )
            .await;

        tracing::info!(
            admin = %sender,
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "broadcast finished"
        );
        let reply = format!(
            "broadcast sent to {} users ({} failed)",
            report.delivered.len(),
            report.failed.len()
        );
        Ok(Outcome {
            reply: Some(reply),
            fanout: Some(report),
        })
    }

    async fn fan_out(&self, recipients: &[UserId], body: &str, correlation: &str) -> FanoutReport {
        let mut report = FanoutReport::default();
        for recipient in recipients {
            let msg = OutboundMessage::new(recipient.clone(), body).with_correlation(correlation);
            let outcome = send_with_retry(self.transport.as_ref(), &msg, self.cfg.retry).await;
            report.record(recipient.clone(), outcome);
        }
        report
    }

    async fn inspect(&self, target: &UserId) -> String {
        let Some(rec) = self.store.get(target).await else {
            return format!("no record for {target}");
        };
        let list = |ids: &std::collections::BTreeSet<UserId>| {
            if ids.is_empty() {
                "none".to_string()
            } else {
                ids.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(", ")
            }
        };
        format!(
            "{} ({})\nfollowers: {}\nfollowing: {}\npending invites: {}\n\
             blocked: {}\nstopped: {}\nfirst seen: {}",
            rec.id,
            rec.label(),
            list(&rec.followers),
            list(&rec.following),
            list(&rec.pending_invites),
            list(&rec.blocked),
            if rec.opted_out { "yes" } else { "no" },
            rec.first_seen.as_deref().unwrap_or("never"),
        )
    }

    /// Message `to` on behalf of `from`, unless `to` opted out or blocked `from`.
    async fn notify(&self, from: &UserId, to: &UserId, text: String) {
        if let Some(rec) = self.store.get(to).await {
            if rec.opted_out || rec.has_blocked(from) {
                tracing::debug!(from = %from, to = %to, "notification suppressed");
                return;
            }
        }
        self.reply(to, text).await;
    }

    async fn reply(&self, to: &UserId, text: impl Into<String>) -> Delivery {
        let msg = OutboundMessage::new(to.clone(), text);
        send_with_retry(self.transport.as_ref(), &msg, self.cfg.retry).await
    }

    async fn record_or_empty(&self, id: &UserId) -> crate::graph::record::UserRecord {
        self.store
            .get(id)
            .await
            .unwrap_or_else(|| crate::graph::record::UserRecord::empty(id.clone()))
    }

    async fn labels(&self, ids: impl IntoIterator<Item = UserId>) -> String {
        let mut labels = Vec::new();
        for id in ids {
            labels.push(self.store.label(&id).await);
        }
        join_labels(&labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// Records every successful send; always fails for `unreachable` ids.
    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<OutboundMessage>>,
        attempts: Mutex<Vec<UserId>>,
        unreachable: HashSet<UserId>,
    }

    impl RecordingTransport {
        fn failing_for(ids: &[UserId]) -> Self {
            Self {
                unreachable: ids.iter().cloned().collect(),
                ..Default::default()
            }
        }

        /// Drain and return texts sent to `id`.
        fn take_for(&self, id: &UserId) -> Vec<String> {
            let mut sent = self.sent.lock().unwrap();
            let (taken, kept): (Vec<_>, Vec<_>) =
                sent.drain(..).partition(|m| &m.recipient == id);
            *sent = kept;
            taken.into_iter().map(|m| m.text).collect()
        }

        fn all_sent(&self) -> Vec<OutboundMessage> {
            self.sent.lock().unwrap().clone()
        }

        fn attempts_for(&self, id: &UserId) -> usize {
            self.attempts.lock().unwrap().iter().filter(|r| *r == id).count()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn receive(&self) -> Result<Option<Envelope>> {
            Ok(None)
        }

        async fn send(&self, msg: &OutboundMessage) -> Result<()> {
            self.attempts.lock().unwrap().push(msg.recipient.clone());
            if self.unreachable.contains(&msg.recipient) {
                return Err(Error::delivery(&msg.recipient, "unreachable"));
            }
            self.sent.lock().unwrap().push(msg.clone());
            Ok(())
        }
    }

    fn tmp(prefix: &str) -> PathBuf {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        PathBuf::from(format!("/tmp/{prefix}-{}-{ts}", std::process::id()))
    }

    fn uid(n: u32) -> UserId {
        UserId::new(format!("+1555000{n:04}"))
    }

    struct Harness {
        router: Router,
        transport: Arc<RecordingTransport>,
        root: PathBuf,
    }

    impl Harness {
        fn new(prefix: &str, transport: RecordingTransport, admins: &[UserId]) -> Self {
            let root = tmp(prefix);
            let store = Arc::new(GraphStore::open(&root).unwrap());
            let transport = Arc::new(transport);
            let router = Router::new(
                store,
                transport.clone(),
                AdminGate::new(admins.iter().cloned()),
                RouterConfig::default(),
            );
            Self {
                router,
                transport,
                root,
            }
        }

        async fn input(&self, sender: &UserId, text: &str) -> Handled {
            let env = Envelope::direct(sender.clone(), text, 1_605_478_095_592);
            self.router.handle(&env).await
        }

        /// Send `text` as `sender`, expect exactly one reply to `sender`.
        async fn check_in_out(&self, sender: &UserId, text: &str, expected: &str) {
            self.input(sender, text).await;
            let replies = self.transport.take_for(sender);
            assert_eq!(replies, vec![expected.to_string()], "input: {text}");
        }

        /// Register users so later assertions don't see welcome messages.
        async fn greet(&self, users: &[&UserId]) {
            for u in users {
                self.router.store().ensure_user(u).await.unwrap();
            }
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.root);
        }
    }

    #[tokio::test]
    async fn new_user_is_welcomed_once() {
        let h = Harness::new("whispr-router-welcome", RecordingTransport::default(), &[]);
        let nancy = uid(4);

        h.input(&nancy, "/echo hi").await;
        assert_eq!(
            h.transport.take_for(&nancy),
            vec![WELCOME_TEXT.to_string(), "hi".to_string()]
        );
        h.check_in_out(&nancy, "/echo again", "again").await;
    }

    #[tokio::test]
    async fn post_reaches_followers_with_label() {
        let h = Harness::new("whispr-router-post", RecordingTransport::default(), &[]);
        let (alice, bob, carol) = (uid(1), uid(2), uid(3));
        h.greet(&[&alice, &bob, &carol]).await;

        h.check_in_out(&bob, &format!("/follow {alice}"), &format!("followed {alice}"))
            .await;
        assert_eq!(
            h.transport.take_for(&alice),
            vec![format!("{bob} has followed you")]
        );
        h.input(&carol, &format!("/follow {alice}")).await;
        h.transport.take_for(&carol);
        h.transport.take_for(&alice);
        h.check_in_out(&alice, "/name alice", "other users will now see you as alice")
            .await;

        let handled = h.input(&alice, "just setting up my whispr").await;
        let report = handled.fanout.unwrap();
        assert_eq!(report.delivered, vec![bob.clone(), carol.clone()]);
        assert!(report.failed.is_empty());
        assert_eq!(
            h.transport.take_for(&bob),
            vec!["alice: just setting up my whispr".to_string()]
        );
        assert_eq!(
            h.transport.take_for(&carol),
            vec!["alice: just setting up my whispr".to_string()]
        );
        assert!(h.transport.take_for(&alice).is_empty());
    }

    #[tokio::test]
    async fn fan_out_isolates_failing_recipient() {
        let (s, x, y, z) = (uid(1), uid(2), uid(3), uid(4));
        let h = Harness::new(
            "whispr-router-isolation",
            RecordingTransport::failing_for(&[y.clone()]),
            &[],
        );
        h.greet(&[&s, &x, &y, &z]).await;
        for f in [&x, &y, &z] {
            h.router.store().follow(f, &s).await.unwrap();
        }

        let report = h.input(&s, "hello").await.fanout.unwrap();
        assert_eq!(report.delivered, vec![x.clone(), z.clone()]);
        assert_eq!(report.failed_ids(), vec![y.clone()]);
        assert_eq!(report.failed, vec![(y.clone(), 3)]);
        assert_eq!(h.transport.attempts_for(&y), 3);
        assert_eq!(h.transport.take_for(&x), vec![format!("{s}: hello")]);
        assert_eq!(h.transport.take_for(&z), vec![format!("{s}: hello")]);
    }

    #[tokio::test]
    async fn block_suppresses_delivery_but_keeps_follow() {
        let h = Harness::new("whispr-router-block", RecordingTransport::default(), &[]);
        let (a, b) = (uid(1), uid(2));
        h.greet(&[&a, &b]).await;
        h.router.store().follow(&b, &a).await.unwrap();

        h.check_in_out(
            &b,
            &format!("/block {a}"),
            &format!("blocked {a}. you won't receive their posts"),
        )
        .await;

        let report = h.input(&a, "anyone there?").await.fanout;
        assert!(report.is_none());
        assert!(h.transport.take_for(&b).is_empty());
        assert!(h
            .router
            .store()
            .get(&a)
            .await
            .unwrap()
            .followers
            .contains(&b));

        h.check_in_out(&b, &format!("/unblock {a}"), &format!("unblocked {a}"))
            .await;
        h.input(&a, "back").await;
        assert_eq!(h.transport.take_for(&b), vec![format!("{a}: back")]);
    }

    #[tokio::test]
    async fn self_follow_gets_explanatory_reply() {
        let h = Harness::new("whispr-router-self", RecordingTransport::default(), &[]);
        let a = uid(1);
        h.greet(&[&a]).await;
        let before = h.router.store().get(&a).await.unwrap();

        h.check_in_out(&a, &format!("/follow {a}"), &InvalidIntent::SelfFollow.to_string())
            .await;
        h.check_in_out(&a, &format!("/invite {a}"), &InvalidIntent::SelfInvite.to_string())
            .await;
        assert_eq!(h.router.store().get(&a).await.unwrap(), before);
    }

    #[tokio::test]
    async fn unknown_command_changes_nothing() {
        let h = Harness::new("whispr-router-unknown", RecordingTransport::default(), &[]);
        let a = uid(1);
        h.greet(&[&a]).await;
        let before = h.router.store().get(&a).await.unwrap();

        let handled = h.input(&a, "/bogus foo").await;
        assert_eq!(
            handled.intent,
            Some(Intent::Unknown {
                verb: "bogus".to_string()
            })
        );
        assert_eq!(
            h.transport.take_for(&a),
            vec!["no such command 'bogus'. text /help to see commands".to_string()]
        );
        assert_eq!(h.router.store().get(&a).await.unwrap(), before);

        h.check_in_out(&a, "/follow 11", "usage: /follow [number]. follow someone")
            .await;
    }

    #[tokio::test]
    async fn invite_accept_round_trip() {
        let h = Harness::new("whispr-router-invite", RecordingTransport::default(), &[]);
        let (a, b) = (uid(1), uid(2));
        h.greet(&[&a, &b]).await;

        h.check_in_out(&a, &format!("/invite {b}"), &format!("invited {b}"))
            .await;
        assert_eq!(
            h.transport.take_for(&b),
            vec![format!(
                "{a} invited you to follow them on whispr. \
                 text /accept {a} to accept or /decline {a} to ignore"
            )]
        );
        assert!(h
            .router
            .store()
            .get(&a)
            .await
            .unwrap()
            .pending_invites
            .contains(&b));

        h.check_in_out(&b, &format!("/accept {a}"), &format!("followed {a}"))
            .await;
        let ra = h.router.store().get(&a).await.unwrap();
        assert!(ra.followers.contains(&b));
        assert!(!ra.pending_invites.contains(&b));
        assert!(h.router.store().get(&b).await.unwrap().following.contains(&a));
        h.transport.take_for(&a);

        h.check_in_out(
            &b,
            &format!("/accept {a}"),
            &InvalidIntent::NoPendingInvite(a.clone()).to_string(),
        )
        .await;
        h.check_in_out(&a, &format!("/invite {b}"), &format!("{b} is already following you"))
            .await;
    }

    #[tokio::test]
    async fn non_admin_broadcast_sends_nothing() {
        let admin = uid(9);
        let h = Harness::new(
            "whispr-router-admin",
            RecordingTransport::default(),
            &[admin.clone()],
        );
        let (a, b) = (uid(1), uid(2));
        h.greet(&[&a, &b, &admin]).await;

        h.check_in_out(&a, "/broadcast hello all", NOT_ADMIN_TEXT).await;
        assert!(h.transport.all_sent().is_empty());

        let report = h.input(&admin, "/broadcast hello all").await.fanout.unwrap();
        assert_eq!(report.delivered, vec![a.clone(), b.clone()]);
        assert_eq!(
            h.transport.take_for(&a),
            vec!["[broadcast] hello all".to_string()]
        );
        assert_eq!(
            h.transport.take_for(&admin),
            vec!["broadcast sent to 2 users (0 failed)".to_string()]
        );
    }

    #[tokio::test]
    async fn opted_out_users_get_no_posts() {
        let h = Harness::new("whispr-router-stop", RecordingTransport::default(), &[]);
        let (a, b) = (uid(1), uid(2));
        h.greet(&[&a, &b]).await;
        h.router.store().follow(&b, &a).await.unwrap();

        h.check_in_out(&b, "/stop", "i'll stop messaging you. text /start to resume messages")
            .await;
        h.input(&a, "post one").await;
        assert!(h.transport.take_for(&b).is_empty());

        h.check_in_out(&b, "/start", "welcome back").await;
        h.check_in_out(&b, "/start", "you weren't stopped").await;
        h.input(&a, "post two").await;
        assert_eq!(h.transport.take_for(&b), vec![format!("{a}: post two")]);
    }

    #[tokio::test]
    async fn lists_and_softblock() {
        let h = Harness::new("whispr-router-lists", RecordingTransport::default(), &[]);
        let (a, b, c) = (uid(1), uid(2), uid(3));
        h.greet(&[&a, &b, &c]).await;

        h.check_in_out(&a, "/followers", "you don't have any followers").await;
        h.check_in_out(&a, "/following", "you aren't following anyone").await;

        h.router.store().follow(&b, &a).await.unwrap();
        h.router.store().follow(&c, &a).await.unwrap();
        h.router.store().set_name(&c, "carol").await.unwrap();
        h.check_in_out(&a, "/followers", &format!("{b}, carol")).await;
        h.check_in_out(&b, "/following", &a.to_string()).await;

        h.check_in_out(&a, &format!("/softblock {b}"), &format!("softblocked {b}"))
            .await;
        h.check_in_out(&a, &format!("/softblock {b}"), &format!("{b} isn't following you"))
            .await;
        assert!(h.router.store().get(&b).await.unwrap().following.is_empty());
    }

    #[tokio::test]
    async fn unfollow_and_help() {
        let h = Harness::new("whispr-router-help", RecordingTransport::default(), &[]);
        let (a, b) = (uid(1), uid(2));
        h.greet(&[&a, &b]).await;

        h.check_in_out(&a, &format!("/unfollow {b}"), &format!("you aren't following {b}"))
            .await;
        h.check_in_out(&a, "/help", &intent::help_text()).await;
        h.check_in_out(&a, "/help name", "/name [name]. set or change your name")
            .await;
        h.check_in_out(&a, "/help hlep", "no such command 'hlep'").await;
    }

    #[tokio::test]
    async fn force_invite_is_admin_only_and_notifies_target() {
        let admin = uid(9);
        let h = Harness::new(
            "whispr-router-forceinvite",
            RecordingTransport::default(),
            &[admin.clone()],
        );
        let (a, b) = (uid(1), uid(2));
        h.greet(&[&a, &b, &admin]).await;

        h.check_in_out(&a, &format!("/forceinvite {b}"), NOT_ADMIN_TEXT)
            .await;
        assert!(h.router.store().get(&a).await.unwrap().followers.is_empty());
        assert!(h.transport.take_for(&b).is_empty());

        h.check_in_out(
            &admin,
            &format!("/forceinvite {b}"),
            &format!("{b} is now following you"),
        )
        .await;
        assert_eq!(
            h.transport.take_for(&b),
            vec![format!("you are now following {admin}")]
        );
        assert!(h
            .router
            .store()
            .get(&admin)
            .await
            .unwrap()
            .followers
            .contains(&b));
        assert!(h.router.store().get(&b).await.unwrap().following.contains(&admin));

        h.check_in_out(
            &admin,
            &format!("/forceinvite {b}"),
            &format!("{b} is already following you"),
        )
        .await;
        h.check_in_out(
            &admin,
            &format!("/forceinvite {admin}"),
            &InvalidIntent::SelfInvite.to_string(),
        )
        .await;

        h.input(&admin, "admin post").await;
        assert_eq!(h.transport.take_for(&b), vec![format!("{admin}: admin post")]);
    }

    #[tokio::test]
    async fn admin_shutdown_cancels_token() {
        let admin = uid(9);
        let root = tmp("whispr-router-shutdown");
        let store = Arc::new(GraphStore::open(&root).unwrap());
        let transport = Arc::new(RecordingTransport::default());
        let token = CancellationToken::new();
        let router = Router::new(
            store,
            transport.clone(),
            AdminGate::new([admin.clone()]),
            RouterConfig::default(),
        )
        .with_shutdown(token.clone());

        router
            .handle(&Envelope::direct(uid(1), "/shutdown", 1))
            .await;
        assert!(!token.is_cancelled());

        router
            .handle(&Envelope::direct(admin.clone(), "/shutdown", 2))
            .await;
        assert!(token.is_cancelled());

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn group_messages_are_ignored() {
        let h = Harness::new("whispr-router-group", RecordingTransport::default(), &[]);
        let a = uid(1);
        let mut env = Envelope::direct(a.clone(), "/follow +15550000002", 1);
        env.group_id = Some("group-1".to_string());

        let handled = h.router.handle(&env).await;
        assert!(handled.intent.is_none());
        assert!(h.transport.all_sent().is_empty());
        assert!(h.router.store().get(&a).await.is_none());
    }
}
