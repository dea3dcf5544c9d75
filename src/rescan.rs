use crate::classify::{Classifier, RspamdClient};
use crate::config::Config;
use crate::directory::{Directory, FilterctlClient};
use crate::error::{RescanError, Step};
use crate::headers::{HeaderBlock, RoutingContext};
use crate::maildir::{scan_message_files, MailboxResolver, MessageFile};
use crate::output;
use crate::reputation::{Reputation, SenderScoreResolver};
use crate::rewrite::{rewrite, HeaderDelta, Lookups};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};

/// Outcome of a batch rescan.
#[derive(Debug, Default)]
pub struct RescanReport {
    /// Output files written, in processing order
    pub rewritten: Vec<PathBuf>,
    /// Per-message failures; only populated when `continue_on_error` is set
    pub failures: Vec<RescanError>,
    pub interrupted: bool,
}

impl RescanReport {
    pub fn count(&self) -> usize {
        self.rewritten.len()
    }
}

/// Everything one rescan run needs: configuration plus the collaborator handles.
pub struct Session<C, R, D> {
    config: Config,
    resolver: MailboxResolver,
    classifier: C,
    reputation: R,
    directory: Mutex<D>,
    interrupt: Arc<AtomicBool>,
}

impl Session<RspamdClient, SenderScoreResolver, FilterctlClient> {
    /// Session wired to rspamd, the system DNS resolver and the filterctl service.
    pub fn connect(config: Config) -> anyhow::Result<Self> {
        let classifier = RspamdClient::new(&config)?;
        let reputation = SenderScoreResolver::from_system_conf(
            &config.reputation_domain,
            Duration::from_secs(config.timeout_seconds),
        )?;
        let directory = FilterctlClient::new(&config)?;
        Ok(Session::new(config, classifier, reputation, directory))
    }
}

impl<C, R, D> Session<C, R, D>
where
    C: Classifier,
    R: Reputation,
    D: Directory,
{
    pub fn new(config: Config, classifier: C, reputation: R, directory: D) -> Self {
        let resolver = MailboxResolver::new(&config.mail_root, config.maildir_name.clone());
        Self {
            config,
            resolver,
            classifier,
            reputation,
            directory: Mutex::new(directory),
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Flag that stops a running batch before its next message once set.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        self.interrupt.clone()
    }

    /// The address book / class client; all access is serialized here.
    pub async fn directory(&self) -> MutexGuard<'_, D> {
        self.directory.lock().await
    }

    /// Rescan the messages of `folder` owned by `account`, all of them or only
    /// those whose Message-Id is listed in `ids`.
    pub async fn rescan(
        &self,
        account: &str,
        folder: &str,
        ids: &[String],
    ) -> Result<RescanReport, RescanError> {
        log::info!("Rescan: account={account} folder={folder} ids={}", ids.len());
        for (i, id) in ids.iter().enumerate() {
            log::debug!("   [{i}] {id}");
        }

        let dir = self.resolver.resolve(account, folder)?;
        let files = scan_message_files(&dir, ids)?;

        let mut report = RescanReport::default();
        for file in &files {
            if self.interrupt.load(Ordering::SeqCst) {
                log::warn!("Rescan interrupted after {} messages", report.count());
                report.interrupted = true;
                break;
            }
            match self.rescan_message(account, file).await {
                Ok(path) => report.rewritten.push(path),
                Err(e) if self.config.continue_on_error => {
                    log::error!("{e}");
                    report.failures.push(e);
                }
                Err(e) => return Err(e),
            }
        }

        log::info!(
            "Rescan complete: {} rewritten, {} failed",
            report.count(),
            report.failures.len()
        );
        Ok(report)
    }

    /// Classify one message and write its rewritten copy; returns the output path.
    pub async fn rescan_message(
        &self,
        account: &str,
        file: &MessageFile,
    ) -> Result<PathBuf, RescanError> {
        let path = file.path.as_path();
        let fail = |step: Step| move |e: anyhow::Error| RescanError::at(step, path, e);

        let target = output::output_path(path).map_err(fail(Step::Output))?;
        let content = std::fs::read(path)
            .map_err(anyhow::Error::from)
            .map_err(fail(Step::ReadMessage))?;

        let headers = HeaderBlock::parse(&content);
        let context = RoutingContext::from_headers(&headers).map_err(fail(Step::RoutingContext))?;

        let verdict = self
            .classifier
            .classify(&content, &context)
            .await
            .map_err(fail(Step::Classification))?;

        let reputation = self
            .reputation
            .reputation(context.sender_ip)
            .await
            .map_err(fail(Step::Reputation))?;

        let (books, class) = {
            let mut directory = self.directory().await;
            let books = directory
                .books_containing(account, &context.from)
                .await
                .map_err(fail(Step::AddressBook))?;
            let class = directory
                .class_for(account, verdict.score)
                .await
                .map_err(fail(Step::ClassLookup))?;
            (books, class)
        };

        let lookups = Lookups {
            reputation,
            books,
            class,
        };
        let delta = HeaderDelta::new(&verdict, &lookups, self.config.max_header_length);
        let rewritten = rewrite(&content, &delta).map_err(fail(Step::Rewrite))?;

        output::write_message(&target, &rewritten).map_err(fail(Step::Output))?;
        log::info!(
            "Rescanned {} -> {} (score {:.3}, class {})",
            path.display(),
            target.display(),
            verdict.score,
            lookups.class
        );
        Ok(target)
    }
}
