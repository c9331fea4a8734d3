//! In-memory test doubles for the host, the container runtime and the VM collaborators.
//!
//! Fakes that take part in ordering checks share an [`Events`] log; each recorded call is a
//! short string such as `destroy vm-1`.

use std::{
    collections::{BTreeMap, HashSet},
    io::{Cursor, Read},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use wardenutils::{command_line, CmdOutput, CmdRunner, Sleeper, WardenutilsError, WardenutilsResult};

use crate::{
    config::PortMapping,
    runtime::{
        Container, ContainerClient, ContainerInfo, ContainerSpec, Process, ProcessOutput,
        ProcessSpec, Properties, StreamInSpec, StreamOutSpec,
    },
    vm::{AgentEnv, AgentEnvService, FileService, HostBindMounts, IdGenerator, MetadataService, Ports},
    WardenCpiError, WardenCpiResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A call log shared between fakes.
pub type Events = Arc<Mutex<Vec<String>>>;

type CmdHandler = Box<dyn Fn(&str, &[String]) -> WardenutilsResult<CmdOutput> + Send + Sync>;

/// Operations that should fail, by name.
#[derive(Default)]
struct Failures(Mutex<HashSet<String>>);

/// Runs host commands through a closure and records their command lines.
pub struct FakeCmdRunner {
    handler: CmdHandler,
    calls: Mutex<Vec<String>>,
}

/// Records requested sleeps without sleeping.
#[derive(Default)]
pub struct FakeSleeper {
    sleeps: Mutex<Vec<Duration>>,
}

/// A container with an in-memory filesystem.
///
/// `bash -c` scripts are interpreted just enough to emulate the `mv` and `cp` steps of the
/// file transfer protocol. Every other process is recorded and exits 0.
pub struct FakeContainer {
    handle: String,
    files: Mutex<BTreeMap<String, Bytes>>,
    scripts: Mutex<Vec<Vec<String>>>,
    processes: Mutex<Vec<ProcessSpec>>,
    failures: Failures,
    events: Events,
}

/// A finished process.
pub struct FakeProcess {
    output: ProcessOutput,
}

/// A container runtime holding [`FakeContainer`]s.
#[derive(Default)]
pub struct FakeContainerClient {
    containers: Mutex<Vec<Arc<FakeContainer>>>,
    created_specs: Mutex<Vec<ContainerSpec>>,
    container_failures: Mutex<Vec<String>>,
    failures: Failures,
    events: Events,
}

/// A file service over an in-memory map.
#[derive(Default)]
pub struct FakeFileService {
    files: Mutex<BTreeMap<String, Bytes>>,
    upload_order: Mutex<Vec<String>>,
    fail_uploads: AtomicBool,
}

/// Records port forwarding calls.
#[derive(Default)]
pub struct FakePorts {
    failures: Failures,
    events: Events,
}

/// Records bind mount calls and hands out paths under `/host`.
#[derive(Default)]
pub struct FakeHostBindMounts {
    failures: Failures,
    events: Events,
}

/// Keeps an agent env in memory. Fetch fails until something is stored.
#[derive(Default)]
pub struct FakeAgentEnvService {
    agent_env: Mutex<Option<AgentEnv>>,
    failures: Failures,
    events: Events,
}

/// Records which VMs had their metadata saved.
#[derive(Default)]
pub struct FakeMetadataService {
    saved: Mutex<Vec<String>>,
    failures: Failures,
    events: Events,
}

/// Always generates the same id.
pub struct FixedIdGenerator(String);

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates an empty call log.
pub fn events() -> Events {
    Events::default()
}

/// Builds the error a failed host command produces.
pub fn cmd_failed(command: &str, stderr: &str) -> WardenutilsError {
    WardenutilsError::CommandFailed {
        command: command.to_string(),
        exit_code: Some(1),
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

fn record(events: &Events, event: impl Into<String>) {
    events.lock().unwrap().push(event.into());
}

fn single_file_tar(name: &str, contents: &[u8]) -> Bytes {
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o640);

    let mut builder = tar::Builder::new(Vec::new());
    builder.append_data(&mut header, name, contents).unwrap();
    Bytes::from(builder.into_inner().unwrap())
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Failures {
    fn add(&self, op: &str) {
        self.0.lock().unwrap().insert(op.to_string());
    }

    fn check(&self, op: &str) -> WardenCpiResult<()> {
        if self.0.lock().unwrap().contains(op) {
            return Err(WardenCpiError::Runtime(format!("{op} failed")));
        }

        Ok(())
    }
}

impl FakeCmdRunner {
    /// Answers every command with `handler`.
    pub fn new(
        handler: impl Fn(&str, &[String]) -> WardenutilsResult<CmdOutput> + Send + Sync + 'static,
    ) -> Self {
        Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Succeeds with empty output for every command.
    pub fn succeeding() -> Self {
        Self::new(|_, _| Ok(CmdOutput::default()))
    }

    /// Command lines run so far.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl FakeSleeper {
    /// Sleeps requested so far.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }
}

impl FakeContainer {
    /// Creates an empty container.
    pub fn new(handle: &str) -> Self {
        Self::with_events(handle, events())
    }

    /// Creates an empty container recording into `events`.
    pub fn with_events(handle: &str, events: Events) -> Self {
        Self {
            handle: handle.to_string(),
            files: Mutex::new(BTreeMap::new()),
            scripts: Mutex::new(Vec::new()),
            processes: Mutex::new(Vec::new()),
            failures: Failures::default(),
            events,
        }
    }

    /// Contents of the file at `path`.
    pub fn file(&self, path: &str) -> Option<Bytes> {
        self.files.lock().unwrap().get(path).cloned()
    }

    /// Writes a file.
    pub fn put_file(&self, path: &str, contents: &[u8]) {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), Bytes::copy_from_slice(contents));
    }

    /// Arguments of every `bash -c` script run so far.
    pub fn scripts(&self) -> Vec<Vec<String>> {
        self.scripts.lock().unwrap().clone()
    }

    /// Every non-script process run so far.
    pub fn processes(&self) -> Vec<ProcessSpec> {
        self.processes.lock().unwrap().clone()
    }

    /// Makes `op` fail: `info`, `run`, `run <path>`, `stream_in`, `stream_out` or `stop`.
    pub fn fail_on(&self, op: &str) {
        self.failures.add(op);
    }

    /// Makes every stream in fail.
    pub fn fail_stream_in(&self) {
        self.fail_on("stream_in");
    }

    fn run_script(&self, args: &[String]) -> ProcessOutput {
        self.scripts.lock().unwrap().push(args.to_vec());

        let script = args.get(1).map(String::as_str).unwrap_or_default();
        let positional = args.get(3..).unwrap_or_default();
        let mut files = self.files.lock().unwrap();

        let (src, dst) = match positional {
            [src, dst, ..] => (src, dst),
            _ => return failed_output("missing operands"),
        };

        let Some(contents) = files.get(src).cloned() else {
            return failed_output(&format!("cannot stat '{src}': No such file or directory"));
        };

        if script.starts_with("mv") {
            files.remove(src);
        }
        files.insert(dst.clone(), contents);

        ProcessOutput::default()
    }
}

impl FakeContainerClient {
    /// Creates a client recording into `events`.
    pub fn with_events(events: Events) -> Self {
        Self {
            events,
            ..Default::default()
        }
    }

    /// Adds a live container.
    pub fn add_container(&self, handle: &str) -> Arc<FakeContainer> {
        let container = Arc::new(FakeContainer::with_events(handle, self.events.clone()));
        self.containers.lock().unwrap().push(container.clone());
        container
    }

    /// The live container with `handle`.
    pub fn container(&self, handle: &str) -> Option<Arc<FakeContainer>> {
        self.containers
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.handle == handle)
            .cloned()
    }

    /// Specs of every created container.
    pub fn created_specs(&self) -> Vec<ContainerSpec> {
        self.created_specs.lock().unwrap().clone()
    }

    /// Makes `op` fail: `create`, `destroy` or `containers`.
    pub fn fail_on(&self, op: &str) {
        self.failures.add(op);
    }

    /// Makes `op` fail on containers created from now on.
    pub fn fail_container(&self, op: &str) {
        self.container_failures.lock().unwrap().push(op.to_string());
    }
}

impl FakeFileService {
    /// Contents of the file at `path`.
    pub fn file(&self, path: &str) -> Option<Bytes> {
        self.files.lock().unwrap().get(path).cloned()
    }

    /// Paths in the order they were uploaded.
    pub fn upload_order(&self) -> Vec<String> {
        self.upload_order.lock().unwrap().clone()
    }

    /// Makes every upload fail.
    pub fn fail_uploads(&self) {
        self.fail_uploads.store(true, Ordering::SeqCst);
    }
}

impl FakePorts {
    /// Creates ports recording into `events`.
    pub fn with_events(events: Events) -> Self {
        Self {
            events,
            ..Default::default()
        }
    }

    /// Makes `op` fail: `forward` or `remove_forwarded`.
    pub fn fail_on(&self, op: &str) {
        self.failures.add(op);
    }
}

impl FakeHostBindMounts {
    /// Creates bind mounts recording into `events`.
    pub fn with_events(events: Events) -> Self {
        Self {
            events,
            ..Default::default()
        }
    }

    /// Makes `op` fail, e.g. `make_persistent`.
    pub fn fail_on(&self, op: &str) {
        self.failures.add(op);
    }

    fn call(&self, op: &str, event: String) -> WardenCpiResult<()> {
        record(&self.events, event);
        self.failures.check(op)
    }
}

impl FakeAgentEnvService {
    /// Creates a service recording into `events`.
    pub fn with_events(events: Events) -> Self {
        Self {
            events,
            ..Default::default()
        }
    }

    /// Stores `agent_env` without recording a call.
    pub fn set(&self, agent_env: AgentEnv) {
        *self.agent_env.lock().unwrap() = Some(agent_env);
    }

    /// The stored agent env.
    pub fn current(&self) -> Option<AgentEnv> {
        self.agent_env.lock().unwrap().clone()
    }

    /// Makes `op` fail: `fetch` or `update`.
    pub fn fail_on(&self, op: &str) {
        self.failures.add(op);
    }
}

impl FakeMetadataService {
    /// Creates a service recording into `events`.
    pub fn with_events(events: Events) -> Self {
        Self {
            events,
            ..Default::default()
        }
    }

    /// VM ids saved so far.
    pub fn saved(&self) -> Vec<String> {
        self.saved.lock().unwrap().clone()
    }

    /// Makes every save fail.
    pub fn fail_on(&self, op: &str) {
        self.failures.add(op);
    }
}

impl FixedIdGenerator {
    /// Generates `id` every time.
    pub fn new(id: &str) -> Self {
        Self(id.to_string())
    }
}

fn failed_output(message: &str) -> ProcessOutput {
    ProcessOutput {
        exit_code: 1,
        stdout: Bytes::new(),
        stderr: Bytes::from(message.to_string()),
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl CmdRunner for FakeCmdRunner {
    async fn run_command(&self, program: &str, args: &[String]) -> WardenutilsResult<CmdOutput> {
        self.calls.lock().unwrap().push(command_line(program, args));
        (self.handler)(program, args)
    }
}

#[async_trait]
impl Sleeper for FakeSleeper {
    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
    }
}

#[async_trait]
impl Container for FakeContainer {
    fn handle(&self) -> &str {
        &self.handle
    }

    async fn info(&self) -> WardenCpiResult<ContainerInfo> {
        record(&self.events, format!("info {}", self.handle));
        self.failures.check("info")?;

        Ok(ContainerInfo {
            state: "active".to_string(),
            container_ip: "10.244.0.2".to_string(),
            host_ip: "10.244.0.1".to_string(),
        })
    }

    async fn run(&self, spec: ProcessSpec) -> WardenCpiResult<Box<dyn Process>> {
        record(
            &self.events,
            format!("run {} {}", self.handle, spec.get_path()),
        );
        self.failures.check("run")?;
        self.failures.check(&format!("run {}", spec.get_path()))?;

        let output = if spec.get_path() == "bash" {
            self.run_script(spec.get_args())
        } else {
            self.processes.lock().unwrap().push(spec);
            ProcessOutput::default()
        };

        Ok(Box::new(FakeProcess { output }))
    }

    async fn stream_in(&self, spec: StreamInSpec) -> WardenCpiResult<()> {
        self.failures.check("stream_in")?;

        let dir = spec.get_path().trim_end_matches('/').to_string();
        let mut archive = tar::Archive::new(Cursor::new(spec.get_tar_stream().clone()));

        for entry in archive.entries()? {
            let mut entry = entry?;
            let name = entry.path()?.display().to_string();

            let mut contents = Vec::new();
            entry.read_to_end(&mut contents)?;
            self.put_file(&format!("{dir}/{name}"), &contents);
        }

        Ok(())
    }

    async fn stream_out(&self, spec: StreamOutSpec) -> WardenCpiResult<Bytes> {
        self.failures.check("stream_out")?;

        let path = spec.get_path();
        let contents = self
            .file(path)
            .ok_or_else(|| WardenCpiError::Runtime(format!("'{path}' does not exist")))?;

        let name = Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(single_file_tar(&name, &contents))
    }

    async fn stop(&self, kill: bool) -> WardenCpiResult<()> {
        record(&self.events, format!("stop {} kill={kill}", self.handle));
        self.failures.check("stop")
    }
}

#[async_trait]
impl Process for FakeProcess {
    fn id(&self) -> &str {
        "fake-process"
    }

    async fn wait(&mut self) -> WardenCpiResult<ProcessOutput> {
        Ok(self.output.clone())
    }
}

#[async_trait]
impl ContainerClient for FakeContainerClient {
    async fn create(&self, spec: ContainerSpec) -> WardenCpiResult<Arc<dyn Container>> {
        record(&self.events, format!("create {}", spec.get_handle()));
        self.failures.check("create")?;

        let container = self.add_container(spec.get_handle());
        for op in self.container_failures.lock().unwrap().iter() {
            container.fail_on(op);
        }

        self.created_specs.lock().unwrap().push(spec);
        Ok(container)
    }

    async fn destroy(&self, handle: &str) -> WardenCpiResult<()> {
        record(&self.events, format!("destroy {handle}"));
        self.failures.check("destroy")?;

        self.containers.lock().unwrap().retain(|c| c.handle != handle);
        Ok(())
    }

    async fn containers(&self, _filter: Properties) -> WardenCpiResult<Vec<Arc<dyn Container>>> {
        self.failures.check("containers")?;

        Ok(self
            .containers
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.clone() as Arc<dyn Container>)
            .collect())
    }
}

#[async_trait]
impl FileService for FakeFileService {
    async fn upload(&self, path: &str, contents: Bytes) -> WardenCpiResult<()> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(WardenCpiError::Runtime(format!("uploading '{path}' failed")));
        }

        self.files.lock().unwrap().insert(path.to_string(), contents);
        self.upload_order.lock().unwrap().push(path.to_string());
        Ok(())
    }

    async fn download(&self, path: &str) -> WardenCpiResult<Bytes> {
        self.file(path)
            .ok_or_else(|| WardenCpiError::Runtime(format!("'{path}' does not exist")))
    }
}

#[async_trait]
impl Ports for FakePorts {
    async fn forward(
        &self,
        vm_id: &str,
        container_ip: &str,
        mappings: &[PortMapping],
    ) -> WardenCpiResult<()> {
        let mappings = mappings
            .iter()
            .map(|m| format!("{}:{}/{}", m.host(), m.container(), m.protocol()))
            .collect::<Vec<_>>()
            .join(",");

        record(
            &self.events,
            format!("forward {vm_id} {container_ip} {mappings}"),
        );
        self.failures.check("forward")
    }

    async fn remove_forwarded(&self, vm_id: &str) -> WardenCpiResult<()> {
        record(&self.events, format!("remove_forwarded {vm_id}"));
        self.failures.check("remove_forwarded")
    }
}

#[async_trait]
impl HostBindMounts for FakeHostBindMounts {
    async fn make_ephemeral(&self, vm_id: &str) -> WardenCpiResult<PathBuf> {
        self.call("make_ephemeral", format!("make_ephemeral {vm_id}"))?;
        Ok(PathBuf::from("/host/ephemeral").join(vm_id))
    }

    async fn delete_ephemeral(&self, vm_id: &str) -> WardenCpiResult<()> {
        self.call("delete_ephemeral", format!("delete_ephemeral {vm_id}"))
    }

    async fn make_persistent(&self, vm_id: &str) -> WardenCpiResult<PathBuf> {
        self.call("make_persistent", format!("make_persistent {vm_id}"))?;
        Ok(PathBuf::from("/host/persistent").join(vm_id))
    }

    async fn delete_persistent(&self, vm_id: &str) -> WardenCpiResult<()> {
        self.call("delete_persistent", format!("delete_persistent {vm_id}"))
    }

    async fn mount_persistent(
        &self,
        vm_id: &str,
        disk_id: &str,
        disk_path: &Path,
    ) -> WardenCpiResult<()> {
        self.call(
            "mount_persistent",
            format!("mount_persistent {vm_id} {disk_id} {}", disk_path.display()),
        )
    }

    async fn unmount_persistent(&self, vm_id: &str, disk_id: &str) -> WardenCpiResult<()> {
        self.call(
            "unmount_persistent",
            format!("unmount_persistent {vm_id} {disk_id}"),
        )
    }
}

#[async_trait]
impl AgentEnvService for FakeAgentEnvService {
    async fn fetch(&self) -> WardenCpiResult<AgentEnv> {
        record(&self.events, "fetch");
        self.failures.check("fetch")?;

        self.current()
            .ok_or_else(|| WardenCpiError::Runtime("agent env does not exist".to_string()))
    }

    async fn update(&self, agent_env: &AgentEnv) -> WardenCpiResult<()> {
        record(&self.events, "update");
        self.failures.check("update")?;

        self.set(agent_env.clone());
        Ok(())
    }
}

#[async_trait]
impl MetadataService for FakeMetadataService {
    async fn save(&self, _file_service: &dyn FileService, vm_id: &str) -> WardenCpiResult<()> {
        record(&self.events, format!("save {vm_id}"));
        self.failures.check("save")?;

        self.saved.lock().unwrap().push(vm_id.to_string());
        Ok(())
    }
}

impl IdGenerator for FixedIdGenerator {
    fn generate(&self) -> WardenCpiResult<String> {
        Ok(self.0.clone())
    }
}
