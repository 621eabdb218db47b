//! Single-process host for the club services.
//!
//! Wires the upstream gateway, the in-memory broker, every consumer and the
//! payment service together the way they run in production, minus the HTTP
//! edges.

pub mod config;
pub mod error;

use std::sync::Arc;

use event_bus::topics;
use event_bus::{
    Broker, EventHandler, EventPublisher, InMemoryBroker, InMemoryDeadLetters, Subscription,
};
use gateway::{InMemoryDirectory, Remotes, UpstreamGateway};
use payments::{
    AccountDeletionConsumer, AccountReplicaConsumer, DebtReminderJob, InMemoryLedger,
    PaymentLedger, PaymentService, PostgresLedger, SandboxPaymentProvider,
};
use replicas::{
    EnrollmentRosterConsumer, FeedbackCleanupConsumer, FeedbackStore, LoggingMailer, Mailer,
    NotificationConsumer,
};
use tokio::task::JoinHandle;

pub use config::{LogFormat, NodeConfig};
pub use error::{NodeError, Result};

/// Consumer groups, one per subscribing service.
pub mod group {
    pub const PAYMENT: &str = "payment-service";
    pub const ENROLLMENT: &str = "enrollment-service";
    pub const FEEDBACK: &str = "feedback-service";
    pub const NOTIFICATION: &str = "notification-service";
}

/// A running node. Dropping it leaves background tasks running; call
/// [`shutdown`](Self::shutdown).
pub struct Node {
    broker: InMemoryBroker,
    dead_letters: InMemoryDeadLetters,
    publisher: Arc<EventPublisher>,
    gateway: UpstreamGateway,
    directory: Arc<InMemoryDirectory>,
    ledger: Arc<dyn PaymentLedger>,
    payments: Arc<PaymentService>,
    reminders: Arc<DebtReminderJob>,
    roster: EnrollmentRosterConsumer,
    feedback: FeedbackStore,
    notifications: NotificationConsumer,
    subscriptions: Vec<Subscription>,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Starts a node with log-only mail delivery.
    pub async fn start(config: NodeConfig) -> Result<Self> {
        Self::start_with_mailer(config, Arc::new(LoggingMailer)).await
    }

    pub async fn start_with_mailer(config: NodeConfig, mailer: Arc<dyn Mailer>) -> Result<Self> {
        let dead_letters = InMemoryDeadLetters::new();
        let broker = InMemoryBroker::new(config.partitions, Arc::new(dead_letters.clone()));
        let publisher = Arc::new(EventPublisher::new(Arc::new(broker.clone())));

        let ledger = open_ledger(config.database_url.as_deref()).await?;
        let payments = Arc::new(PaymentService::new(
            ledger.clone(),
            Arc::new(SandboxPaymentProvider::new()),
            publisher.clone(),
            config.payments.clone(),
        ));
        let reminders = Arc::new(DebtReminderJob::new(
            ledger.clone(),
            publisher.clone(),
            config.payments.clone(),
        ));

        let directory = Arc::new(InMemoryDirectory::new());
        let gateway = UpstreamGateway::new(
            Remotes::uniform(directory.clone()),
            Arc::new(config.gate_registry()),
            config.cache_ttls,
        );

        let roster = EnrollmentRosterConsumer::new();
        let feedback = FeedbackStore::new();
        let notifications = NotificationConsumer::new(mailer, config.notifications.clone());

        let mut node = Self {
            broker,
            dead_letters,
            publisher,
            gateway,
            directory,
            ledger,
            payments,
            reminders,
            roster,
            feedback,
            notifications,
            subscriptions: Vec::new(),
            tasks: Vec::new(),
        };
        node.subscribe_all().await?;
        node.spawn_background();

        metrics::gauge!("node_subscriptions").set(node.subscriptions.len() as f64);
        tracing::info!(
            partitions = node.broker.partitions(),
            subscriptions = node.subscriptions.len(),
            postgres = config.database_url.is_some(),
            "node started"
        );
        Ok(node)
    }

    async fn subscribe_all(&mut self) -> Result<()> {
        let account_replica: Arc<dyn EventHandler> =
            Arc::new(AccountReplicaConsumer::new(self.ledger.clone()));
        let account_deletion: Arc<dyn EventHandler> =
            Arc::new(AccountDeletionConsumer::new(self.ledger.clone()));
        let roster: Arc<dyn EventHandler> = Arc::new(self.roster.clone());
        let feedback: Arc<dyn EventHandler> =
            Arc::new(FeedbackCleanupConsumer::new(self.feedback.clone()));
        let notifications: Arc<dyn EventHandler> = Arc::new(self.notifications.clone());

        let plan: Vec<(&str, &str, Arc<dyn EventHandler>)> = vec![
            (topics::USER_REGISTERED, group::PAYMENT, account_replica),
            (topics::USER_DELETED, group::PAYMENT, account_deletion),
            (topics::USER_REGISTERED, group::ENROLLMENT, roster.clone()),
            (topics::ENROLLMENT_CREATED, group::ENROLLMENT, roster.clone()),
            (topics::USER_DELETED, group::ENROLLMENT, roster),
            (topics::USER_DELETED, group::FEEDBACK, feedback),
            (topics::USER_REGISTERED, group::NOTIFICATION, notifications.clone()),
            (topics::ENROLLMENT_CREATED, group::NOTIFICATION, notifications.clone()),
            (topics::PAYMENT_RECEIVED, group::NOTIFICATION, notifications.clone()),
            (topics::PAYMENT_DEBT_REMINDER, group::NOTIFICATION, notifications.clone()),
            (topics::USER_DELETED, group::NOTIFICATION, notifications),
        ];
        for (topic, group, handler) in plan {
            let subscription = self.broker.subscribe(topic, group, handler).await?;
            self.subscriptions.push(subscription);
        }
        Ok(())
    }

    fn spawn_background(&mut self) {
        let publisher = self.publisher.clone();
        self.tasks
            .push(tokio::spawn(async move { publisher.run_retry_loop().await }));

        let reminders = self.reminders.clone();
        self.tasks
            .push(tokio::spawn(async move { reminders.run().await }));
    }

    pub fn broker(&self) -> &InMemoryBroker {
        &self.broker
    }

    pub fn dead_letters(&self) -> &InMemoryDeadLetters {
        &self.dead_letters
    }

    pub fn publisher(&self) -> &Arc<EventPublisher> {
        &self.publisher
    }

    pub fn gateway(&self) -> &UpstreamGateway {
        &self.gateway
    }

    /// Stand-in for the remote services the gateway reads from.
    pub fn directory(&self) -> &Arc<InMemoryDirectory> {
        &self.directory
    }

    pub fn ledger(&self) -> &Arc<dyn PaymentLedger> {
        &self.ledger
    }

    pub fn payments(&self) -> &Arc<PaymentService> {
        &self.payments
    }

    pub fn reminders(&self) -> &Arc<DebtReminderJob> {
        &self.reminders
    }

    pub fn roster(&self) -> &EnrollmentRosterConsumer {
        &self.roster
    }

    pub fn feedback(&self) -> &FeedbackStore {
        &self.feedback
    }

    pub fn notifications(&self) -> &NotificationConsumer {
        &self.notifications
    }

    /// Stops background tasks and consumer workers.
    pub async fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        for subscription in self.subscriptions {
            subscription.unsubscribe();
        }
        let pending = self.publisher.pending_retries();
        if pending > 0 {
            tracing::warn!(pending, "shutting down with unpublished events");
        }
        tracing::info!("node stopped");
    }
}

async fn open_ledger(database_url: Option<&str>) -> Result<Arc<dyn PaymentLedger>> {
    let Some(url) = database_url else {
        tracing::info!("using in-memory payment ledger");
        return Ok(Arc::new(InMemoryLedger::new()));
    };

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(url)
        .await?;
    let ledger = PostgresLedger::new(pool);
    ledger.run_migrations().await?;
    tracing::info!("using PostgreSQL payment ledger");
    Ok(Arc::new(ledger))
}
