//! The supervisor itself.
//!
//! Single-threaded and cooperative: one event loop consumes everything —
//! actor comm traffic, control commands, child exits, OS signals — from
//! one queue, fed by small relay tasks. Actors run in their own OS
//! processes and are driven purely through their signal links.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use snafu::ResultExt;
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::mpsc,
};
use uuid::Uuid;

use actor_api::{PortRef, SpawnSpec};
use link_api::{
    Command, LinkBroker, LinkError, LinkReceiver, LinkSender, LinkSpec, Signal,
};
use store_api::{
    unlink_region, AofOpts, PortSpec, ShmStore, StoreDescriptor, StoreService,
    StoreServiceOpts, DEFAULT_STORE_PORT,
};

use super::{
    actors::{resolve_package, ActorRuntime, ActorState},
    sockets::{ControlSocket, OutputPublisher},
    Config as ConfigCtx, Event, LinkSetup, NexusError, Spawn, StoreStart,
};
use crate::subsys::{ActorSpec, CliOverrides, PipelineSpec, StoreBackend};

/// Endpoint name the supervisor uses for its own link ends.
const NEXUS_NAME: &str = "nexus";
/// Comm link kept even without a GUI, as the front-end channel.
const GUI_COMM: &str = "GUI_comm";
/// Name of the synthesized watcher actor.
const WATCHER_NAME: &str = "Watcher";
/// Queue slots on signal and comm links.
const SIGNAL_LINK_CAPACITY: usize = 16;
/// Total budget for children to exit at shutdown before they are killed.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
/// Head start actors get to react to `quit` before SIGTERM.
const QUIT_GRACE: Duration = Duration::from_millis(1000);

/// Command-line inputs merged into the document settings.
#[derive(Debug, Clone)]
pub struct NexusArgs {
    /// Pipeline document path.
    pub config: PathBuf,
    /// Control port; 0 = auto-allocate (file setting wins over 0).
    pub control_port: u16,
    /// Output port; 0 = auto-allocate (file setting wins over 0).
    pub output_port: u16,
    /// Store byte budget (file setting wins).
    pub store_size: Option<u64>,
}

enum StoreBackendHandle {
    Arena { region: String, _map: ShmStore },
    Service(StoreService),
}

enum Flow {
    Continue,
    Quit,
}

/// The running supervisor.
pub struct Nexus {
    spec: PipelineSpec,
    broker: LinkBroker,
    broker_socket: PathBuf,
    store: Option<StoreBackendHandle>,
    output: OutputPublisher,
    control: ControlSocket,
    events_tx: mpsc::Sender<Event>,
    events: mpsc::Receiver<Event>,
    actors: BTreeMap<String, ActorRuntime>,
    sig_links: BTreeMap<String, LinkSender>,
    stopped: bool,
}

impl Nexus {
    /// Bring the whole pipeline up: sockets, store backend, links, actor
    /// processes. Errors here are fatal and happen before the loop.
    pub async fn start(args: NexusArgs) -> Result<Nexus, NexusError> {
        info!(
            "************ new pipeline session {} ************",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
        );

        let mut spec = PipelineSpec::from_file(&args.config).context(ConfigCtx)?;
        if let Ok(text) = std::fs::read_to_string(&args.config) {
            info!("pipeline document {}:\n{}", args.config.display(), text);
        }
        spec.apply_cli(&CliOverrides {
            control_port: args.control_port,
            output_port: args.output_port,
            store_size: args.store_size,
        });

        let (events_tx, events) = mpsc::channel(256);
        let output = OutputPublisher::bind(spec.settings.output_port()).await?;
        let control =
            ControlSocket::bind(spec.settings.control_port(), events_tx.clone()).await?;
        info!(
            "control socket on port {}, output socket on port {}",
            control.port(),
            output.port()
        );

        let (store, descriptor) = start_store(&spec).await?;
        output.publish("StoreInterface started").await;

        let broker = LinkBroker::new();
        let broker_socket =
            std::env::temp_dir().join(format!("nexus-{}.sock", std::process::id()));
        let links = plan_links(&spec);
        for link in &links {
            broker.register(link.clone()).context(LinkSetup)?;
        }
        broker.serve(&broker_socket).await.context(LinkSetup)?;

        let mut actors = BTreeMap::new();
        let mut declared: Vec<(String, ActorSpec, bool)> = Vec::new();
        if let Some((gui_name, gui_spec)) = &spec.gui {
            declared.push((gui_name.clone(), gui_spec.clone(), true));
        }
        for (name, actor_spec) in &spec.actors {
            declared.push((name.clone(), actor_spec.clone(), false));
        }
        for (name, actor_spec, is_gui) in declared {
            let program = resolve_package(&actor_spec.package)?;
            let spawn_spec =
                build_spawn_spec(&name, &actor_spec, &links, &broker_socket, &descriptor);
            let daemon = actor_spec
                .options
                .get("daemon")
                .and_then(|value| value.as_bool())
                .unwrap_or(true);
            if !daemon {
                info!("actor '{}' is not daemonic", name);
            }
            if let Some(method) = actor_spec
                .options
                .get("method")
                .and_then(|value| value.as_str())
            {
                if method != "spawn" {
                    warn!(
                        "actor '{}' asks for start method '{}'; children are always spawned",
                        name, method
                    );
                }
            }
            actors.insert(name.clone(), ActorRuntime {
                name,
                spec: actor_spec,
                program,
                args_prefix: Vec::new(),
                spawn_spec,
                is_gui,
                daemon,
                pid: None,
                state: ActorState::Spawned,
            });
        }

        if !spec.settings.watched().is_empty() {
            let watcher_spec = ActorSpec {
                package: String::new(),
                classname: WATCHER_NAME.to_string(),
                options: serde_json::Value::Null,
            };
            let program = std::env::current_exe().context(Spawn {
                actor: WATCHER_NAME,
            })?;
            let spawn_spec = build_spawn_spec(
                WATCHER_NAME,
                &watcher_spec,
                &links,
                &broker_socket,
                &descriptor,
            );
            actors.insert(WATCHER_NAME.to_string(), ActorRuntime {
                name: WATCHER_NAME.to_string(),
                spec: watcher_spec,
                program,
                args_prefix: vec!["watcher".to_string()],
                spawn_spec,
                is_gui: false,
                daemon: true,
                pid: None,
                state: ActorState::Spawned,
            });
        }

        let mut sig_links = BTreeMap::new();
        for name in actors.keys() {
            let sender = broker
                .local_sender(&format!("{}_sig", name))
                .context(LinkSetup)?;
            sig_links.insert(name.clone(), sender);

            let receiver = broker
                .local_receiver(&format!("{}_comm", name), NEXUS_NAME)
                .context(LinkSetup)?;
            spawn_comm_relay(name.clone(), receiver, events_tx.clone());
        }
        if spec.gui.is_none() {
            let receiver = broker
                .local_receiver(GUI_COMM, NEXUS_NAME)
                .context(LinkSetup)?;
            spawn_comm_relay("GUI".to_string(), receiver, events_tx.clone());
        }

        spawn_signal_task(events_tx.clone());

        let mut nexus = Nexus {
            spec,
            broker,
            broker_socket,
            store: Some(store),
            output,
            control,
            events_tx,
            events,
            actors,
            sig_links,
            stopped: false,
        };
        nexus.spawn_all()?;
        nexus.output.publish("Awaiting input:").await;
        Ok(nexus)
    }

    /// The control socket port actually bound.
    pub fn control_port(&self) -> u16 {
        self.control.port()
    }

    /// The output socket port actually bound.
    pub fn output_port(&self) -> u16 {
        self.output.port()
    }

    fn spawn_all(&mut self) -> Result<(), NexusError> {
        // the GUI owns user interaction and comes up first
        if let Some(gui_name) = self.spec.gui.as_ref().map(|(name, _)| name.clone()) {
            if let Some(runtime) = self.actors.get_mut(&gui_name) {
                runtime.spawn(&self.events_tx)?;
            }
        }
        let names: Vec<String> = self.actors.keys().cloned().collect();
        for name in names {
            let events = self.events_tx.clone();
            if let Some(runtime) = self.actors.get_mut(&name) {
                if runtime.pid.is_none() {
                    runtime.spawn(&events)?;
                }
            }
        }
        info!("all actor processes started");
        Ok(())
    }

    /// The polling loop. Returns after `quit` or a termination signal;
    /// shutdown has completed by then.
    pub async fn run(&mut self) -> Result<(), NexusError> {
        loop {
            let event = match self.events.recv().await {
                Some(event) => event,
                None => break,
            };
            match event {
                Event::Command(command) => {
                    if let Flow::Quit = self.handle_command(command).await? {
                        break;
                    }
                }
                Event::UnknownCommand(line) => {
                    warn!("unknown command '{}'", line);
                    self.output
                        .publish(&format!("Unknown command: {}", line))
                        .await;
                }
                Event::Comm {
                    actor,
                    signal,
                } => self.handle_comm(&actor, signal).await,
                Event::ChildExit {
                    actor,
                    code,
                } => self.handle_child_exit(&actor, code).await,
                Event::OsSignal(name) => {
                    warn!("shutting down on {}; steps may be out of order", name);
                    self.shutdown().await;
                    break;
                }
            }
        }
        info!("polling has stopped");
        Ok(())
    }

    async fn handle_command(&mut self, command: Command) -> Result<Flow, NexusError> {
        info!("received command '{}'", command);
        match command {
            Command::Setup => {
                self.stopped = false;
                self.broadcast(Signal::Setup).await;
            }
            Command::Run => {
                if self.allow_run() {
                    info!("Begin run");
                    self.broadcast(Signal::Run).await;
                    for runtime in self.actors.values_mut() {
                        if runtime.state == ActorState::Ready {
                            runtime.state = ActorState::Running;
                        }
                    }
                } else {
                    error!("Not all actors ready yet");
                    self.output
                        .publish(
                            "Not all actors ready yet, please wait and then try again.",
                        )
                        .await;
                }
            }
            Command::Stop => {
                warn!("Starting stop procedure");
                self.stopped = true;
                self.broadcast(Signal::Stop).await;
                for runtime in self.actors.values_mut() {
                    if runtime.state.alive() {
                        runtime.state = ActorState::Stopping;
                    }
                }
            }
            Command::Quit => {
                self.shutdown().await;
                return Ok(Flow::Quit);
            }
            Command::Kill(actor) => match self.actors.get(&actor) {
                Some(runtime) => runtime.kill(),
                None => {
                    self.output
                        .publish(&format!("No actor named '{}'", actor))
                        .await;
                }
            },
            Command::Revive => self.revive().await?,
            Command::Load(path) => match PipelineSpec::from_file(&path) {
                Ok(new_spec) => {
                    info!("loaded pipeline document {}", path.display());
                    self.spec = new_spec;
                    self.output
                        .publish("Config loaded; applies after a stop and restart")
                        .await;
                }
                Err(error) => {
                    error!("failed to load '{}': {}", path.display(), error);
                    self.output
                        .publish(&format!("Config load failed: {}", error))
                        .await;
                }
            },
            Command::Ready => {
                if self.allow_run() {
                    self.output.publish("All actors ready").await;
                } else {
                    let waiting: Vec<&str> = self
                        .actors
                        .values()
                        .filter(|runtime| runtime.state != ActorState::Ready)
                        .map(|runtime| runtime.name.as_str())
                        .collect();
                    self.output
                        .publish(&format!("Waiting for: {}", waiting.join(", ")))
                        .await;
                }
            }
            Command::Pause => {
                info!("Pausing processes is not implemented");
                self.output.publish("pause is not implemented").await;
            }
        }
        Ok(Flow::Continue)
    }

    async fn handle_comm(&mut self, actor: &str, signal: Signal) {
        info!("Received signal '{}' from '{}'", signal, actor);
        match signal {
            Signal::Ready => {
                if let Some(runtime) = self.actors.get_mut(actor) {
                    runtime.state = ActorState::Ready;
                }
                if self.allow_run() {
                    info!("All actors ready; allowing start");
                    self.output.publish("All actors ready").await;
                }
            }
            Signal::StopSuccess => {
                if let Some(runtime) = self.actors.get_mut(actor) {
                    runtime.state = ActorState::Stopped;
                }
                let all_stopped = self
                    .actors
                    .values()
                    .filter(|runtime| runtime.state.alive())
                    .all(|runtime| runtime.state == ActorState::Stopped);
                if self.stopped && all_stopped {
                    self.stopped = false;
                    info!("All stops were successful");
                    self.output.publish("All stops were successful").await;
                }
            }
            Signal::Status(message) => {
                info!("{}: {}", actor, message);
                self.output.publish(&format!("{}: {}", actor, message)).await;
            }
            other => debug!("ignoring '{}' from '{}'", other, actor),
        }
    }

    async fn handle_child_exit(&mut self, actor: &str, code: i32) {
        if let Some(runtime) = self.actors.get_mut(actor) {
            runtime.state = ActorState::Dead(code);
            runtime.pid = None;
        }
        if code == 0 {
            info!("actor '{}' exited cleanly", actor);
        } else {
            warn!("actor '{}' exited with code {}", actor, code);
        }
        self.output
            .publish(&format!("{} exited with code {}", actor, code))
            .await;
    }

    fn allow_run(&self) -> bool {
        self.actors
            .values()
            .all(|runtime| runtime.state == ActorState::Ready)
    }

    async fn broadcast(&mut self, signal: Signal) {
        for (name, link) in self.sig_links.iter_mut() {
            match link.put_obj_nowait(&signal).await {
                Ok(()) => {}
                Err(LinkError::Full {
                    ..
                }) => {
                    // tolerated for everything but quit, which is
                    // followed by termination anyway
                    warn!("Signal queue {}_sig is full", name);
                }
                Err(error) => {
                    warn!("signal to '{}' failed: {}", name, error);
                }
            }
        }
    }

    /// Rebuild every dead non-GUI actor with its original spawn spec and
    /// drive it back through `setup` and `run`.
    async fn revive(&mut self) -> Result<(), NexusError> {
        warn!("Starting revive");
        let dead: Vec<String> = self
            .actors
            .values()
            .filter(|runtime| !runtime.state.alive() && !runtime.is_gui)
            .map(|runtime| runtime.name.clone())
            .collect();
        if dead.is_empty() {
            self.output.publish("No dead actors to revive").await;
            return Ok(());
        }
        for name in dead {
            let events = self.events_tx.clone();
            if let Some(runtime) = self.actors.get_mut(&name) {
                runtime.spawn(&events)?;
            }
            if let Some(link) = self.sig_links.get_mut(&name) {
                let _ = link.put_obj_nowait(&Signal::Setup).await;
                let _ = link.put_obj_nowait(&Signal::Run).await;
            }
            self.output.publish(&format!("Revived {}", name)).await;
        }
        Ok(())
    }

    /// Orderly teardown: announce, signal, terminate, join, release the
    /// store and every ephemeral file.
    pub async fn shutdown(&mut self) {
        warn!("Destroying Nexus");
        self.output.publish("QUIT").await;
        self.broadcast(Signal::Quit).await;

        self.drain_exits(QUIT_GRACE).await;
        let deadline = Instant::now() + SHUTDOWN_TIMEOUT;
        for runtime in self.actors.values() {
            if runtime.state.alive() && runtime.pid.is_some() {
                runtime.terminate();
            }
        }
        self.drain_exits(deadline.saturating_duration_since(Instant::now()))
            .await;
        for runtime in self.actors.values() {
            if runtime.state.alive() && runtime.pid.is_some() {
                warn!(
                    "actor '{}' did not exit within the shutdown timeout",
                    runtime.name
                );
                runtime.kill();
            }
        }
        self.drain_exits(Duration::from_secs(1)).await;
        warn!("Actors terminated");

        match self.store.take() {
            Some(StoreBackendHandle::Arena {
                region,
                _map,
            }) => {
                drop(_map);
                if let Err(error) = unlink_region(&region) {
                    warn!("store region '{}' already removed: {}", region, error);
                }
            }
            Some(StoreBackendHandle::Service(service)) => {
                service.stop().await;
            }
            None => {}
        }

        self.broker.close_all();
        let _ = std::fs::remove_file(&self.broker_socket);
        info!("Nexus shutdown complete");
    }

    async fn drain_exits(&mut self, window: Duration) {
        let deadline = Instant::now() + window;
        loop {
            let waiting = self
                .actors
                .values()
                .any(|runtime| runtime.state.alive() && runtime.pid.is_some());
            if !waiting {
                break;
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break;
            }
            match tokio::time::timeout(left, self.events.recv()).await {
                Ok(Some(Event::ChildExit {
                    actor,
                    code,
                })) => self.handle_child_exit(&actor, code).await,
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(_) => break,
            }
        }
    }
}

async fn start_store(
    spec: &PipelineSpec,
) -> Result<(StoreBackendHandle, StoreDescriptor), NexusError> {
    match spec.settings.store_backend {
        StoreBackend::Inproc => {
            let region = format!("/nexus-store-{}", Uuid::new_v4().simple());
            let map = ShmStore::create(&region, spec.settings.store_size())
                .context(StoreStart)?;
            info!("store region '{}' created", region);
            let descriptor = StoreDescriptor::Arena {
                region: region.clone(),
                size: spec.settings.store_size(),
            };
            Ok((
                StoreBackendHandle::Arena {
                    region,
                    _map: map,
                },
                descriptor,
            ))
        }
        StoreBackend::External => {
            let persistence = spec.settings.persistence().context(ConfigCtx)?;
            let port = match spec.settings.redis_port {
                Some(port) => PortSpec::Explicit(port),
                None => PortSpec::Probe {
                    from: DEFAULT_STORE_PORT,
                },
            };
            let aof = match (&persistence.saving_enabled, &persistence.aof_dir) {
                (true, Some(dir)) => {
                    info!(
                        "store saving enabled, directory '{}', schedule {:?}",
                        dir.display(),
                        persistence.fsync
                    );
                    Some(AofOpts {
                        dir: dir.clone(),
                        fsync: persistence.fsync,
                    })
                }
                _ => {
                    info!("store saving disabled");
                    None
                }
            };
            let service = StoreService::start(StoreServiceOpts {
                port,
                budget: spec.settings.store_size(),
                aof,
            })
            .await
            .context(StoreStart)?;
            let descriptor = StoreDescriptor::Service {
                port: service.port(),
            };
            Ok((StoreBackendHandle::Service(service), descriptor))
        }
    }
}

/// Plan every broker link of a pipeline: the data links from
/// `connections`, a signal/comm pair per actor, the GUI placeholder comm,
/// and the watcher's shadow links.
pub fn plan_links(spec: &PipelineSpec) -> Vec<LinkSpec> {
    let mut links = Vec::new();
    let mut used = std::collections::HashSet::new();

    for (source, sinks) in &spec.connections {
        if sinks.is_empty() {
            continue;
        }
        let source_actor = source.split('.').next().unwrap_or(source);
        let capacity = spec.link_capacity(source);
        if sinks.len() > 1 {
            let name = format!("{}_multi", source_actor);
            links.push(LinkSpec::fan_out(
                &name,
                source,
                sinks,
                capacity,
                spec.link_on_full(source),
            ));
            used.insert(name);
        } else {
            let sink = &sinks[0];
            let sink_actor = sink.split('.').next().unwrap_or(sink);
            let mut name = format!("{}_{}", source_actor, sink_actor);
            if !used.insert(name.clone()) {
                // two connections between the same pair of actors
                name = format!("{}_{}", source.replace('.', "_"), sink_actor);
                used.insert(name.clone());
            }
            links.push(LinkSpec::simple(&name, source, sink, capacity));
        }
    }

    let mut actor_names: Vec<String> = Vec::new();
    if let Some((gui_name, _)) = &spec.gui {
        actor_names.push(gui_name.clone());
    }
    actor_names.extend(spec.actors.keys().cloned());
    if !spec.settings.watched().is_empty() {
        actor_names.push(WATCHER_NAME.to_string());
        for watched in spec.settings.watched() {
            links.push(LinkSpec::simple(
                &format!("{}_watch", watched),
                &format!("{}.watchout", watched),
                &format!("{}.{}", WATCHER_NAME, watched),
                spec.settings.link_capacity(),
            ));
        }
    }
    for name in &actor_names {
        links.push(LinkSpec::simple(
            &format!("{}_sig", name),
            NEXUS_NAME,
            name,
            SIGNAL_LINK_CAPACITY,
        ));
        links.push(LinkSpec::simple(
            &format!("{}_comm", name),
            name,
            NEXUS_NAME,
            SIGNAL_LINK_CAPACITY,
        ));
    }
    if spec.gui.is_none() {
        links.push(LinkSpec::simple(
            GUI_COMM,
            "GUI",
            NEXUS_NAME,
            SIGNAL_LINK_CAPACITY,
        ));
    }
    links
}

fn build_spawn_spec(
    name: &str,
    actor: &ActorSpec,
    links: &[LinkSpec],
    broker_socket: &Path,
    store: &StoreDescriptor,
) -> SpawnSpec {
    let mut inputs = Vec::new();
    let mut outputs = Vec::new();
    for link in links {
        if let Some((source_actor, port)) = link.source.split_once('.') {
            if source_actor == name {
                outputs.push(PortRef {
                    port: port.to_string(),
                    link: link.name.clone(),
                    sink: None,
                });
            }
        }
        for sink in &link.sinks {
            if let Some((sink_actor, port)) = sink.split_once('.') {
                if sink_actor == name {
                    inputs.push(PortRef {
                        port: port.to_string(),
                        link: link.name.clone(),
                        sink: Some(sink.clone()),
                    });
                }
            }
        }
    }
    SpawnSpec {
        name: name.to_string(),
        classname: actor.classname.clone(),
        options: actor.options.clone(),
        broker_socket: broker_socket.to_path_buf(),
        store: store.clone(),
        signal_link: PortRef {
            port: "signal".to_string(),
            link: format!("{}_sig", name),
            sink: Some(name.to_string()),
        },
        comm_link: format!("{}_comm", name),
        inputs,
        outputs,
    }
}

fn spawn_comm_relay(
    actor: String,
    mut receiver: LinkReceiver,
    events: mpsc::Sender<Event>,
) {
    tokio::spawn(async move {
        loop {
            match receiver.get_obj::<Signal>().await {
                Ok(signal) => {
                    let event = Event::Comm {
                        actor: actor.clone(),
                        signal,
                    };
                    if events.send(event).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });
}

fn spawn_signal_task(events: mpsc::Sender<Event>) {
    tokio::spawn(async move {
        let mut interrupt = match signal(SignalKind::interrupt()) {
            Ok(stream) => stream,
            Err(_) => return,
        };
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(_) => return,
        };
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(stream) => stream,
            Err(_) => return,
        };
        let name = tokio::select! {
            _ = interrupt.recv() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
            _ = hangup.recv() => "SIGHUP",
        };
        let _ = events.send(Event::OsSignal(name)).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subsys::PipelineSpec;

    fn demo_spec(extra: &str) -> PipelineSpec {
        let text = format!(
            "actors:\n  Acquirer:\n    package: sample-actors\n    classname: Generator\n  Analysis:\n    package: sample-actors\n    classname: Accumulator\nconnections:\n  Acquirer.q_out: [Analysis.q_in]\n{}",
            extra
        );
        PipelineSpec::from_str(&text).unwrap()
    }

    #[test]
    fn links_cover_data_signal_comm_and_gui_placeholder() {
        let spec = demo_spec("");
        let links = plan_links(&spec);
        let names: Vec<&str> = links.iter().map(|link| link.name.as_str()).collect();
        assert!(names.contains(&"Acquirer_Analysis"));
        assert!(names.contains(&"Acquirer_sig"));
        assert!(names.contains(&"Acquirer_comm"));
        assert!(names.contains(&"Analysis_sig"));
        assert!(names.contains(&"Analysis_comm"));
        assert!(names.contains(&"GUI_comm"));
    }

    #[test]
    fn fan_out_connections_become_multi_links() {
        let text = "actors:\n  A:\n    package: p\n    classname: C\n  B:\n    package: p\n    classname: C\n  C:\n    package: p\n    classname: C\nconnections:\n  A.q_out: [B.q_in, C.q_in]\n";
        let spec = PipelineSpec::from_str(text).unwrap();
        let links = plan_links(&spec);
        let multi = links.iter().find(|link| link.name == "A_multi").unwrap();
        assert_eq!(multi.sinks, vec!["B.q_in".to_string(), "C.q_in".to_string()]);
    }

    #[test]
    fn watcher_links_shadow_the_watched() {
        let spec = demo_spec("settings:\n  use_watcher: [Acquirer]\n");
        let links = plan_links(&spec);
        let names: Vec<&str> = links.iter().map(|link| link.name.as_str()).collect();
        assert!(names.contains(&"Acquirer_watch"));
        assert!(names.contains(&"Watcher_sig"));
        assert!(names.contains(&"Watcher_comm"));

        let store = StoreDescriptor::Arena {
            region: "/r".to_string(),
            size: 1,
        };
        let actor = ActorSpec {
            package: String::new(),
            classname: WATCHER_NAME.to_string(),
            options: serde_json::Value::Null,
        };
        let spawn = build_spawn_spec(
            WATCHER_NAME,
            &actor,
            &links,
            Path::new("/tmp/broker.sock"),
            &store,
        );
        assert_eq!(spawn.inputs.len(), 1);
        assert_eq!(spawn.inputs[0].port, "Acquirer");
        assert_eq!(spawn.inputs[0].link, "Acquirer_watch");
    }

    #[test]
    fn spawn_specs_wire_declared_ports() {
        let spec = demo_spec("settings:\n  use_watcher: [Acquirer]\n");
        let links = plan_links(&spec);
        let store = StoreDescriptor::Arena {
            region: "/r".to_string(),
            size: 1,
        };
        let actor = spec.actors.get("Acquirer").unwrap();
        let spawn = build_spawn_spec(
            "Acquirer",
            actor,
            &links,
            Path::new("/tmp/broker.sock"),
            &store,
        );
        let out_ports: Vec<&str> =
            spawn.outputs.iter().map(|port| port.port.as_str()).collect();
        assert!(out_ports.contains(&"q_out"));
        assert!(out_ports.contains(&"watchout"));
        assert!(spawn.inputs.is_empty());
        assert_eq!(spawn.comm_link, "Acquirer_comm");
        assert_eq!(spawn.signal_link.link, "Acquirer_sig");

        let analysis = spec.actors.get("Analysis").unwrap();
        let spawn = build_spawn_spec(
            "Analysis",
            analysis,
            &links,
            Path::new("/tmp/broker.sock"),
            &store,
        );
        assert_eq!(spawn.inputs.len(), 1);
        assert_eq!(spawn.inputs[0].port, "q_in");
        assert_eq!(spawn.inputs[0].sink.as_deref(), Some("Analysis.q_in"));
        assert!(spawn.outputs.is_empty());
    }
}
