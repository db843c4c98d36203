//! Command loop state and the handler for every command.

use super::{Collaborators, Command, ServerEvents, WatchEvent};
use crate::catalog::{Catalog, DataPaths, LogoSetting, Setting};
use crate::concurrency::{parallelism_for_cores, MAX_PARALLELISM};
use crate::config::{Config, QuietHours};
use crate::encode::ExitPolicy;
use crate::profile::{Profile, AUTO_PREFIX};
use crate::queue::QueueManager;
use crate::resource::ResourceManager;
use crate::rpc::{
    AddQueueRequest, AutoSelectUpdate, ChangeItemData, ClientId, ClientMessage, CommonData,
    EventSink, Inbound, LogFileContent, LogFileRequest, PauseRequest, ProfileUpdate,
    RequestFlags, ServerMessage, ServiceSettingUpdate, StateReport, UiData, UpdateKind,
};
use crate::scheduler::{Admission, WorkerPool};
use crate::status::{collect_disks, timestamp_ms, SharedStatus};
use crate::store::{load_json, prune_transcripts, CheckLogItem, LogFile, LogItem, QueueSnapshot};
use crate::worker::{JobRunner, LogEntry, WorkerOutcome};
use chrono::Utc;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long running workers get to finish once the server is ended.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

pub(super) struct ServerState {
    paths: DataPaths,
    qm: QueueManager,
    catalog: Catalog,
    pool: WorkerPool,
    resources: Arc<ResourceManager>,
    runner: Arc<JobRunner>,
    encode_log: LogFile<LogItem>,
    check_log: LogFile<CheckLogItem>,
    events: Arc<ServerEvents>,
    collaborators: Collaborators,
    tx: mpsc::Sender<Command>,
    /// Token of the add in progress; replaced by every `AddQueue`.
    add_cancel: Arc<Mutex<CancellationToken>>,
    status: SharedStatus,
    persist_wake: Arc<Notify>,
    quiet_window: watch::Sender<Option<QuietHours>>,
    last_state: Option<StateReport>,
    /// Run admission after this command even if the queue says nothing changed.
    kick: bool,
    draining: bool,
}

impl ServerState {
    pub(super) fn new(
        config: &Config,
        paths: DataPaths,
        events: Arc<ServerEvents>,
        collaborators: Collaborators,
        tx: mpsc::Sender<Command>,
        status: SharedStatus,
    ) -> Self {
        let catalog = Catalog::load(&paths, Setting::from_config(config));
        let resources = ResourceManager::new(&catalog.setting.gpu_budgets);
        let sink: Arc<dyn EventSink> = events.clone();

        let mut qm = QueueManager::new(resources.clone(), sink.clone());
        qm.restore(QueueSnapshot::load(&paths.queue()));

        let mut pool = WorkerPool::new(catalog.setting.parallelism, resources.clone());
        if catalog.setting.pause_on_started && qm.has_active() {
            info!("queue paused on start");
            pool.set_pause(true);
        }
        qm.update_all_pending(&catalog);

        let runner = JobRunner::new(
            collaborators.encoder.clone(),
            sink,
            &config.encoder.work_dir,
            paths.logs_dir(),
            ExitPolicy {
                incident_threshold: config.encoder.incident_threshold,
                logo_not_found_exit_code: config.encoder.logo_not_found_exit_code,
            },
        );
        let (quiet_window, _) = watch::channel(catalog.setting.quiet_hours);

        Self {
            encode_log: LogFile::new(paths.encode_log()),
            check_log: LogFile::new(paths.check_log()),
            paths,
            qm,
            catalog,
            pool,
            resources,
            runner: Arc::new(runner),
            events,
            collaborators,
            tx,
            add_cancel: Arc::new(Mutex::new(CancellationToken::new())),
            status,
            persist_wake: Arc::new(Notify::new()),
            quiet_window,
            last_state: None,
            kick: true,
            draining: false,
        }
    }

    pub(super) fn add_cancel(&self) -> Arc<Mutex<CancellationToken>> {
        self.add_cancel.clone()
    }

    pub(super) fn persist_wake(&self) -> Arc<Notify> {
        self.persist_wake.clone()
    }

    pub(super) fn quiet_window(&self) -> watch::Receiver<Option<QuietHours>> {
        self.quiet_window.subscribe()
    }

    /// Apply commands until the server is ended, then flush.
    pub(super) async fn run(&mut self, mut rx: mpsc::Receiver<Command>, stop: CancellationToken) {
        self.after_command().await;
        loop {
            let flow = tokio::select! {
                _ = stop.cancelled(), if !self.draining => self.begin_drain(),
                command = rx.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => Flow::Stop,
                },
            };
            self.after_command().await;
            if flow == Flow::Stop {
                break;
            }
        }
        self.persist();
    }

    async fn handle(&mut self, command: Command) -> Flow {
        match command {
            Command::Client(inbound) => return self.handle_client(inbound).await,
            Command::WorkerFinished(done) => return self.worker_finished(done),
            Command::FilesChanged(events) => self.files_changed(events),
            Command::Persist => self.persist(),
            Command::PruneLogs => self.prune_logs(),
            Command::QuietHours(inside) => {
                info!(inside, "quiet hours");
                self.pool.set_scheduled_suspend(inside);
            }
            Command::Shutdown => {
                warn!(running = self.pool.occupancy(), "drain timed out");
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    async fn handle_client(&mut self, inbound: Inbound) -> Flow {
        let Inbound { client, message } = inbound;
        debug!(client, method = ?message.method(), "command");
        let request_id = message.request_id().map(str::to_owned);
        match message {
            ClientMessage::AddQueue(req) => self.add_queue(&req).await,
            ClientMessage::ChangeItem(data) => self.change_item(&data),
            ClientMessage::PauseEncode(req) => self.pause(&req),
            // Handled before it reaches the loop; a late one has nothing left to cancel.
            ClientMessage::CancelAddQueue(_) => {}
            ClientMessage::SetCommonData(setting) => self.set_common_data(setting),
            ClientMessage::SetServiceSetting(update) => {
                let result = self.set_service_setting(update);
                self.report(result);
            }
            ClientMessage::SetProfile(update) => {
                let result = self.set_profile(update);
                self.report(result);
            }
            ClientMessage::SetAutoSelect(update) => {
                let result = self.set_auto_select(update);
                self.report(result);
            }
            ClientMessage::Request(flags) => self.request(client, flags),
            ClientMessage::RequestLogFile(req) => self.request_log_file(client, &req).await,
            ClientMessage::EndServer => {
                info!(client, "end requested");
                return self.begin_drain();
            }
        }
        if let Some(id) = request_id {
            self.events
                .hub()
                .send_to(client, &ServerMessage::add_result(Some(id)));
        }
        Flow::Continue
    }

    fn publish(&self, message: ServerMessage) {
        self.events.publish(message);
    }

    fn report(&self, result: Result<String, String>) {
        match result {
            Ok(message) => self.publish(ServerMessage::operation_ok(message)),
            Err(message) => {
                warn!(%message, "operation rejected");
                self.publish(ServerMessage::operation_failed(message));
            }
        }
    }

    // ---------------------------------------------------------------------
    // Scheduling

    fn state_report(&self) -> StateReport {
        let pool = self.pool.state();
        StateReport {
            queue_paused: pool.paused,
            suspended: pool.suspended,
            encoder_suspended: pool.worker_suspended,
            scheduled_suspend: pool.scheduled_suspend,
            running: pool.running > 0,
            parallelism: pool.parallelism,
            progress: self.qm.progress(),
        }
    }

    async fn after_command(&mut self) {
        let schedule_dirty = self.qm.take_schedule_dirty();
        if (schedule_dirty | std::mem::take(&mut self.kick)) && !self.draining {
            self.schedule();
        }

        let report = self.state_report();
        if self.last_state.as_ref() != Some(&report) {
            self.publish(ServerMessage::state(report.clone()));
            self.last_state = Some(report.clone());
        }

        let mut status = self.status.write().await;
        status.timestamp_unix_ms = timestamp_ms();
        status.state = report;
        status.counts = self.qm.counts();
        status.queue_len = self.qm.jobs().len();
        status.gpu = self.resources.usage();
        status.clients = self.events.hub().client_count();
    }

    fn schedule(&mut self) {
        for admission in self.pool.admit(self.qm.jobs()) {
            if self.qm.mark_running(admission.job_id) {
                self.spawn_worker(admission);
            } else {
                self.pool.finish(admission.slot, admission.job_id);
            }
        }
    }

    fn spawn_worker(&mut self, admission: Admission) {
        let Some(job) = self.qm.get(admission.job_id).cloned() else {
            self.pool.finish(admission.slot, admission.job_id);
            return;
        };
        debug!(job_id = job.id, slot = admission.slot, "job admitted");
        let runner = self.runner.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let done = runner.run(job, admission).await;
            let _ = tx.send(Command::WorkerFinished(done)).await;
        });
    }

    fn worker_finished(&mut self, done: WorkerOutcome) -> Flow {
        let WorkerOutcome {
            slot,
            job_id,
            outcome,
            log,
        } = done;
        self.pool.finish(slot, job_id);
        self.kick = true;

        match self.qm.finish_job(job_id, &outcome) {
            Some(job) => info!(job_id, state = %job.state, reason = %job.fail_reason, "job finished"),
            None => debug!(job_id, "finished job was removed while running"),
        }

        match log {
            LogEntry::Encode(item) => {
                if let Err(e) = self.encode_log.append(&item) {
                    self.log_write_failed(e.to_string());
                }
                self.publish(ServerMessage::OnUiData(UiData {
                    log_item: Some(item),
                    ..UiData::default()
                }));
            }
            LogEntry::Check(item) => {
                if let Err(e) = self.check_log.append(&item) {
                    self.log_write_failed(e.to_string());
                }
                self.publish(ServerMessage::OnUiData(UiData {
                    check_log_item: Some(item),
                    ..UiData::default()
                }));
            }
        }
        self.persist_wake.notify_one();

        if self.draining && self.pool.occupancy() == 0 {
            Flow::Stop
        } else {
            Flow::Continue
        }
    }

    fn log_write_failed(&self, error: String) {
        warn!(%error, "failed to write log record");
        self.publish(ServerMessage::operation_failed(format!(
            "failed to write log: {}",
            error
        )));
    }

    /// Stop admitting work and wait for the running workers. Workers still
    /// running at the deadline are dropped with their jobs left `Running`,
    /// which the next start puts back in the queue.
    fn begin_drain(&mut self) -> Flow {
        if self.draining {
            return Flow::Continue;
        }
        self.draining = true;
        let running = self.pool.occupancy();
        info!(running, "draining");
        if running == 0 {
            return Flow::Stop;
        }
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(DRAIN_TIMEOUT).await;
            let _ = tx.send(Command::Shutdown).await;
        });
        Flow::Continue
    }

    // ---------------------------------------------------------------------
    // Queue commands

    async fn add_queue(&mut self, req: &AddQueueRequest) {
        let cancel = CancellationToken::new();
        *self.add_cancel.lock() = cancel.clone();
        self.qm.clear_hash_cache();

        let prober = self.collaborators.prober.clone();
        let hook = self.collaborators.hook.clone();
        let result = self
            .qm
            .add_batch(req, &mut self.catalog, prober.as_ref(), hook.as_ref(), &cancel)
            .await;
        match result {
            Ok(summary) if summary.canceled => {
                info!(added = summary.added, "add canceled");
                self.publish(ServerMessage::operation_ok(format!(
                    "add canceled, {} items added",
                    summary.added
                )));
            }
            Ok(summary) => {
                info!(added = summary.added, "add finished");
                self.publish(ServerMessage::operation_ok(format!(
                    "{} items added",
                    summary.added
                )));
            }
            Err(message) => {
                warn!(%message, "add rejected");
                self.publish(ServerMessage::operation_failed(message));
            }
        }
        self.persist_wake.notify_one();
    }

    fn change_item(&mut self, data: &ChangeItemData) {
        match self.qm.change_item(data, &self.catalog, &mut self.pool) {
            Ok(result) => {
                if let Some(admission) = result.started {
                    self.spawn_worker(admission);
                }
                if let Some(message) = result.message {
                    self.publish(ServerMessage::operation_ok(message));
                }
            }
            Err(message) => {
                warn!(item = data.item_id, %message, "change rejected");
                self.publish(ServerMessage::operation_failed(message));
            }
        }
        self.kick = true;
    }

    fn pause(&mut self, req: &PauseRequest) {
        if req.is_queue {
            info!(pause = req.pause, "queue pause");
            self.pool.set_pause(req.pause);
            self.kick = true;
        } else {
            let slot = usize::try_from(req.index).ok();
            info!(slot = ?slot, suspend = req.pause, "worker suspend");
            self.pool.suspend(slot, req.pause);
        }
    }

    // ---------------------------------------------------------------------
    // Catalog commands

    fn set_common_data(&mut self, mut setting: Setting) {
        if setting.parallelism == 0 {
            setting.parallelism = parallelism_for_cores(num_cpus::get() as u32);
        }
        setting.parallelism = setting.parallelism.min(MAX_PARALLELISM);

        self.pool.set_parallelism(setting.parallelism);
        self.resources.set_budgets(&setting.gpu_budgets);
        self.quiet_window.send_replace(setting.quiet_hours);
        self.catalog.setting = setting;
        self.catalog.setting_dirty = true;
        self.persist_wake.notify_one();

        self.qm.update_all_pending(&self.catalog);
        self.kick = true;
        self.publish(ServerMessage::OnCommonData(CommonData {
            setting: Some(self.catalog.setting.clone()),
            ..CommonData::default()
        }));
        self.publish(ServerMessage::operation_ok("settings updated"));
    }

    fn set_service_setting(&mut self, update: ServiceSettingUpdate) -> Result<String, String> {
        let id = update.service_id;
        match update.kind {
            UpdateKind::Add | UpdateKind::Update => {
                let mut data = update
                    .data
                    .clone()
                    .ok_or_else(|| "service setting data missing".to_string())?;
                data.service_id = id;
                self.catalog.services.insert(id, data);
            }
            UpdateKind::Remove => {
                self.catalog
                    .services
                    .remove(&id)
                    .ok_or_else(|| format!("service {} not found", id))?;
            }
        }
        self.catalog.services_dirty = true;
        self.persist_wake.notify_one();
        self.qm.update_all_pending(&self.catalog);
        self.publish(ServerMessage::OnServiceSetting(update));
        Ok(format!("service {} updated", id))
    }

    fn set_profile(&mut self, update: ProfileUpdate) -> Result<String, String> {
        let ProfileUpdate { kind, mut profile } = update;
        let name = profile.name.clone();
        if name.is_empty() || name.starts_with(AUTO_PREFIX) {
            return Err(format!("invalid profile name: {:?}", name));
        }
        let exists = self.catalog.profiles.get(&name).is_some();
        match kind {
            UpdateKind::Add if exists => return Err(format!("profile {} already exists", name)),
            UpdateKind::Update | UpdateKind::Remove if !exists => {
                return Err(format!("profile {} not found", name))
            }
            UpdateKind::Remove => {
                self.catalog.profiles.remove(&name);
                self.catalog.delete_profile_file(&self.paths, &name);
            }
            UpdateKind::Add | UpdateKind::Update => {
                profile.last_update = Utc::now();
                self.catalog
                    .save_profile(&self.paths, &profile)
                    .map_err(|e| format!("failed to save profile {}: {}", name, e))?;
                self.catalog.profiles.upsert(profile.clone());
            }
        }
        self.qm.update_all_pending(&self.catalog);
        self.publish(ServerMessage::OnProfile(ProfileUpdate { kind, profile }));
        Ok(format!("profile {} saved", name))
    }

    fn set_auto_select(&mut self, update: AutoSelectUpdate) -> Result<String, String> {
        let name = update.auto_select.name.clone();
        if name.is_empty() {
            return Err("auto-select list needs a name".to_string());
        }
        let exists = self.catalog.profiles.get_auto_select(&name).is_some();
        match update.kind {
            UpdateKind::Add if exists => {
                return Err(format!("auto-select {} already exists", name))
            }
            UpdateKind::Update | UpdateKind::Remove if !exists => {
                return Err(format!("auto-select {} not found", name))
            }
            UpdateKind::Remove => {
                self.catalog.profiles.remove_auto_select(&name);
            }
            UpdateKind::Add | UpdateKind::Update => {
                self.catalog
                    .profiles
                    .upsert_auto_select(update.auto_select.clone());
            }
        }
        self.catalog
            .save_auto_selects(&self.paths)
            .map_err(|e| format!("failed to save auto-select lists: {}", e))?;
        self.qm.update_all_pending(&self.catalog);
        self.publish(ServerMessage::OnAutoSelect(update));
        Ok(format!("auto-select {} saved", name))
    }

    // ---------------------------------------------------------------------
    // Queries

    fn request(&self, client: ClientId, flags: RequestFlags) {
        let hub = self.events.hub();

        let mut common = CommonData::default();
        if flags.contains(RequestFlags::SETTING) {
            common.setting = Some(self.catalog.setting.clone());
            common.profiles = Some(self.catalog.profiles.profiles().cloned().collect());
            common.auto_selects = Some(self.catalog.profiles.auto_selects().cloned().collect());
        }
        if flags.contains(RequestFlags::SERVICE_SETTING) {
            common.services = Some(self.catalog.services.values().cloned().collect());
        }
        if flags.contains(RequestFlags::FREE_SPACE) {
            let mut dirs: Vec<PathBuf> = self.catalog.setting.watched_outputs.clone();
            for job in self.qm.jobs() {
                if !dirs.contains(&job.dst_dir) {
                    dirs.push(job.dst_dir.clone());
                }
            }
            common.disks = Some(collect_disks(&dirs));
        }
        if common != CommonData::default() {
            hub.send_to(client, &ServerMessage::OnCommonData(common));
        }

        let mut ui = UiData::default();
        if flags.contains(RequestFlags::QUEUE) {
            ui.queue = Some(self.qm.jobs().to_vec());
        }
        if flags.contains(RequestFlags::LOG) {
            ui.log = Some(self.encode_log.read_all());
        }
        if flags.contains(RequestFlags::CHECK_LOG) {
            ui.check_log = Some(self.check_log.read_all());
        }
        if flags.contains(RequestFlags::CONSOLE) {
            ui.console = Some(self.events.console_snapshots());
        }
        if flags.contains(RequestFlags::STATE) {
            ui.state = Some(self.state_report());
        }
        if ui != UiData::default() {
            hub.send_to(client, &ServerMessage::OnUiData(ui));
        }
    }

    async fn request_log_file(&self, client: ClientId, req: &LogFileRequest) {
        let hub = self.events.hub();
        let name = &req.name;
        if name.is_empty() || name.contains(['/', '\\']) || name.contains("..") {
            hub.send_to(
                client,
                &ServerMessage::operation_failed(format!("invalid log file name: {}", name)),
            );
            return;
        }
        let path = self.paths.logs_dir().join(name);
        match tokio::fs::read(&path).await {
            Ok(bytes) => hub.send_to(
                client,
                &ServerMessage::OnLogFile(LogFileContent {
                    name: name.clone(),
                    content: String::from_utf8_lossy(&bytes).into_owned(),
                }),
            ),
            Err(e) => hub.send_to(
                client,
                &ServerMessage::operation_failed(format!("cannot read log {}: {}", name, e)),
            ),
        }
    }

    // ---------------------------------------------------------------------
    // Background work

    fn files_changed(&mut self, events: Vec<WatchEvent>) {
        let mut changed = false;
        for event in events {
            match event {
                WatchEvent::Logo {
                    service_id,
                    file_name,
                } => changed |= self.logo_found(service_id, file_name),
                WatchEvent::Profile(path) => changed |= self.profile_file_changed(path),
            }
        }
        if changed {
            self.qm.update_all_pending(&self.catalog);
            self.persist_wake.notify_one();
        }
    }

    fn logo_found(&mut self, service_id: i32, file_name: String) -> bool {
        let added = self.catalog.register_service(service_id, "");
        let Some(service) = self.catalog.services.get_mut(&service_id) else {
            return false;
        };
        if service.logos.iter().any(|l| l.file_name == file_name) {
            return added;
        }
        info!(service_id, file = %file_name, "logo found");
        service.logos.push(LogoSetting::new(file_name));
        let data = service.clone();
        self.catalog.services_dirty = true;
        self.publish(ServerMessage::OnServiceSetting(ServiceSettingUpdate {
            kind: if added { UpdateKind::Add } else { UpdateKind::Update },
            service_id,
            data: Some(data),
        }));
        true
    }

    fn profile_file_changed(&mut self, path: PathBuf) -> bool {
        let profile = match load_json::<Profile>(&path) {
            Ok(Some(p)) => p,
            Ok(None) => return false,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "profile unreadable");
                return false;
            }
        };
        if profile.name.is_empty() || profile.name.starts_with(AUTO_PREFIX) {
            warn!(path = %path.display(), "profile file has an invalid name");
            return false;
        }
        let kind = match self.catalog.profiles.get(&profile.name) {
            Some(current) if current == &profile => return false,
            Some(_) => UpdateKind::Update,
            None => UpdateKind::Add,
        };
        info!(name = %profile.name, "profile file changed");
        self.catalog.profiles.upsert(profile.clone());
        self.publish(ServerMessage::OnProfile(ProfileUpdate { kind, profile }));
        true
    }

    fn persist(&mut self) {
        if let Err(e) = self.qm.save_if_dirty(&self.paths.queue()) {
            warn!(error = %e, "failed to save queue");
            self.publish(ServerMessage::operation_failed(format!(
                "failed to save queue: {}",
                e
            )));
        }
        if let Err(e) = self.catalog.flush(&self.paths) {
            warn!(error = %e, "failed to save settings");
        }
    }

    fn prune_logs(&self) {
        let setting = &self.catalog.setting;
        if !setting.delete_old_logs {
            return;
        }
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(setting.delete_old_logs_days));
        let encode = self.encode_log.prune_older_than(cutoff).unwrap_or_else(|e| {
            warn!(error = %e, "failed to prune encode log");
            0
        });
        let check = self.check_log.prune_older_than(cutoff).unwrap_or_else(|e| {
            warn!(error = %e, "failed to prune check log");
            0
        });
        let transcripts = prune_transcripts(&self.paths.logs_dir(), cutoff);
        if encode + check + transcripts > 0 {
            info!(encode, check, transcripts, "old logs pruned");
        }
    }
}
