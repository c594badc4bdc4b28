//! Test support utilities shared across unit and integration tests.
//!
//! [`ScriptedProvider`] is an in-memory cloud that records every call and
//! can be told to fail specific operations. [`ScriptedShell`] stands in for
//! SSH, recording connection and execution order per host.

use std::collections::{HashMap, VecDeque};
use std::env;
use std::ffi::OsString;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

use crate::exec::{OutputSink, RemoteShell, ShellError, ShellFuture, ShellSession, ShellTarget};
use crate::instance::{Instance, InstanceName, InstanceState};
use crate::provider::{
    CloudProvider, CreateSpec, LoadBalancerMember, ProviderError, ProviderFuture, Tag,
};

/// Builds an instance record launched `launched` seconds after the epoch.
#[must_use]
pub fn instance_record(id: &str, name: &str, state: InstanceState, launched: i64) -> Instance {
    Instance {
        id: id.to_owned(),
        name: Some(InstanceName::parse(name)).filter(|parsed| !parsed.is_empty()),
        state,
        public_address: None,
        private_address: None,
        launch_time: epoch_offset(launched),
        instance_type: None,
        security_group: None,
        iam_role: None,
        availability_zone: None,
        key_name: None,
        image_id: None,
        load_balancer: None,
    }
}

fn epoch_offset(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(seconds, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

impl Instance {
    /// Sets the public address.
    #[must_use]
    pub fn with_public_address(mut self, address: &str) -> Self {
        self.public_address = Some(address.to_owned());
        self
    }

    /// Sets the commercial type.
    #[must_use]
    pub fn with_type(mut self, instance_type: &str) -> Self {
        self.instance_type = Some(instance_type.to_owned());
        self
    }

    /// Sets the zone.
    #[must_use]
    pub fn with_zone(mut self, zone: &str) -> Self {
        self.availability_zone = Some(zone.to_owned());
        self
    }

    /// Sets the image.
    #[must_use]
    pub fn with_image(mut self, image_id: &str) -> Self {
        self.image_id = Some(image_id.to_owned());
        self
    }

    /// Sets the key pair name.
    #[must_use]
    pub fn with_key_name(mut self, key_name: &str) -> Self {
        self.key_name = Some(key_name.to_owned());
        self
    }

    /// Sets the security group.
    #[must_use]
    pub fn with_security_group(mut self, group: &str) -> Self {
        self.security_group = Some(group.to_owned());
        self
    }
}

/// Provider operations recorded by [`ScriptedProvider`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ProviderCall {
    /// [`CloudProvider::list_instances`].
    ListInstances,
    /// [`CloudProvider::list_zones`].
    ListZones,
    /// [`CloudProvider::list_security_groups`].
    ListSecurityGroups,
    /// [`CloudProvider::list_key_pairs`].
    ListKeyPairs,
    /// [`CloudProvider::list_roles`].
    ListRoles,
    /// [`CloudProvider::list_load_balancers`].
    ListLoadBalancers,
    /// [`CloudProvider::load_balancer_attribution`].
    LoadBalancerAttribution,
    /// [`CloudProvider::load_balancer_zones`].
    LoadBalancerZones,
    /// [`CloudProvider::resolve_image`].
    ResolveImage,
    /// [`CloudProvider::create_instances`].
    CreateInstances,
    /// [`CloudProvider::tag_resources`].
    TagResources,
    /// [`CloudProvider::describe_boot_payload`].
    DescribeBootPayload,
    /// [`CloudProvider::terminate_instance`].
    TerminateInstance,
    /// [`CloudProvider::register_with_load_balancer`].
    RegisterWithLoadBalancer,
}

/// Resource names returned by the catalogue lookups.
#[derive(Clone, Debug, Default)]
pub struct Catalog {
    /// Zones.
    pub zones: Vec<String>,
    /// Key pair names.
    pub key_pairs: Vec<String>,
    /// Security group names.
    pub security_groups: Vec<String>,
    /// Role names.
    pub roles: Vec<String>,
    /// Load balancer names.
    pub load_balancers: Vec<String>,
}

#[derive(Debug, Default)]
struct ProviderState {
    instances: Vec<Instance>,
    members: Vec<LoadBalancerMember>,
    catalog: Catalog,
    load_balancer_zones: HashMap<String, Vec<String>>,
    boot_payloads: HashMap<String, String>,
    images: HashMap<String, String>,
    image_lookups: Vec<(String, Option<String>)>,
    failures: HashMap<ProviderCall, ProviderError>,
    launch_states: VecDeque<InstanceState>,
    terminate_state: Option<InstanceState>,
    created: Vec<String>,
    launch_polls: usize,
    calls: Vec<ProviderCall>,
    create_specs: Vec<CreateSpec>,
    tags: Vec<(Vec<String>, Vec<Tag>)>,
    registrations: Vec<(String, Vec<String>)>,
    terminated: Vec<String>,
}

/// In-memory cloud used to drive fleet operations deterministically.
#[derive(Clone, Debug, Default)]
pub struct ScriptedProvider {
    state: Arc<Mutex<ProviderState>>,
}

impl ScriptedProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ProviderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds an instance to the inventory.
    pub fn push_instance(&self, instance: Instance) {
        self.lock().instances.push(instance);
    }

    /// Records `member` (an id or address) as belonging to `load_balancer`.
    pub fn push_member(&self, load_balancer: &str, member: &str) {
        self.lock().members.push(LoadBalancerMember {
            load_balancer: load_balancer.to_owned(),
            member: member.to_owned(),
        });
    }

    /// Edits the catalogue returned by the list lookups.
    pub fn set_catalog(&self, edit: impl FnOnce(&mut Catalog)) {
        edit(&mut self.lock().catalog);
    }

    /// Sets the zones served by a load balancer.
    pub fn set_load_balancer_zones(&self, load_balancer: &str, zones: &[&str]) {
        self.lock().load_balancer_zones.insert(
            load_balancer.to_owned(),
            zones.iter().map(|zone| (*zone).to_owned()).collect(),
        );
    }

    /// Stores a base64 boot payload for an instance.
    pub fn set_boot_payload(&self, id: &str, base64: &str) {
        self.lock()
            .boot_payloads
            .insert(id.to_owned(), base64.to_owned());
    }

    /// Maps an image label to an identifier.
    pub fn set_image(&self, label: &str, id: &str) {
        self.lock().images.insert(label.to_owned(), id.to_owned());
    }

    /// Makes every later call of `call` fail with `error`.
    pub fn fail(&self, call: ProviderCall, error: ProviderError) {
        self.lock().failures.insert(call, error);
    }

    /// States reported for created instances on successive inventory
    /// lookups. The last reported state sticks once the queue is empty.
    pub fn script_launch_states(&self, states: &[InstanceState]) {
        self.lock().launch_states = states.iter().copied().collect();
    }

    /// State reported by terminations; defaults to `shutting-down`.
    pub fn set_terminate_state(&self, state: InstanceState) {
        self.lock().terminate_state = Some(state);
    }

    /// Every call in order.
    #[must_use]
    pub fn calls(&self) -> Vec<ProviderCall> {
        self.lock().calls.clone()
    }

    /// Number of times `call` was made.
    #[must_use]
    pub fn count(&self, call: ProviderCall) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|recorded| **recorded == call)
            .count()
    }

    /// Inventory lookups made after instances were created.
    #[must_use]
    pub fn launch_polls(&self) -> usize {
        self.lock().launch_polls
    }

    /// Image references and target zones passed to image resolution.
    #[must_use]
    pub fn image_lookups(&self) -> Vec<(String, Option<String>)> {
        self.lock().image_lookups.clone()
    }

    /// Specs passed to creation calls.
    #[must_use]
    pub fn create_specs(&self) -> Vec<CreateSpec> {
        self.lock().create_specs.clone()
    }

    /// Tagging calls.
    #[must_use]
    pub fn tags(&self) -> Vec<(Vec<String>, Vec<Tag>)> {
        self.lock().tags.clone()
    }

    /// Load balancer registrations.
    #[must_use]
    pub fn registrations(&self) -> Vec<(String, Vec<String>)> {
        self.lock().registrations.clone()
    }

    /// Ids passed to termination calls.
    #[must_use]
    pub fn terminated(&self) -> Vec<String> {
        self.lock().terminated.clone()
    }

    /// Current inventory.
    #[must_use]
    pub fn instances(&self) -> Vec<Instance> {
        self.lock().instances.clone()
    }

    fn record(&self, call: ProviderCall) -> Result<(), ProviderError> {
        let mut state = self.lock();
        state.calls.push(call);
        state.failures.get(&call).cloned().map_or(Ok(()), Err)
    }

    fn catalog_list(
        &self,
        call: ProviderCall,
        select: fn(&Catalog) -> &Vec<String>,
    ) -> ProviderFuture<'_, Vec<String>> {
        Box::pin(async move {
            self.record(call)?;
            Ok(select(&self.lock().catalog).clone())
        })
    }

    fn create(&self, spec: &CreateSpec) -> Vec<String> {
        let mut state = self.lock();
        state.create_specs.push(spec.clone());
        let mut ids = Vec::new();
        for _ in 0..spec.count {
            let ordinal = state.created.len() + 1;
            let id = format!("new-{ordinal}");
            let instance = Instance {
                private_address: Some(format!("10.0.0.{ordinal}")),
                instance_type: spec.instance_type.clone(),
                security_group: spec.security_groups.first().cloned(),
                iam_role: spec.iam_role.clone(),
                availability_zone: spec.zone.clone(),
                key_name: spec.key_name.clone(),
                image_id: Some(spec.image_id.clone()),
                ..instance_record(&id, "", InstanceState::Pending, 1_000)
            }
            .with_public_address(&format!("198.51.100.{ordinal}"));
            state.instances.push(instance);
            state.created.push(id.clone());
            ids.push(id);
        }
        ids
    }

    fn advance_launch_state(state: &mut ProviderState) {
        if state.created.is_empty() {
            return;
        }
        state.launch_polls += 1;
        let Some(next) = state.launch_states.pop_front() else {
            return;
        };
        let created = state.created.clone();
        for instance in &mut state.instances {
            if created.contains(&instance.id) {
                instance.state = next;
            }
        }
    }
}

impl CloudProvider for ScriptedProvider {
    fn list_instances(&self) -> ProviderFuture<'_, Vec<Instance>> {
        Box::pin(async move {
            self.record(ProviderCall::ListInstances)?;
            let mut state = self.lock();
            Self::advance_launch_state(&mut state);
            Ok(state.instances.clone())
        })
    }

    fn list_zones(&self) -> ProviderFuture<'_, Vec<String>> {
        self.catalog_list(ProviderCall::ListZones, |catalog| &catalog.zones)
    }

    fn list_security_groups(&self) -> ProviderFuture<'_, Vec<String>> {
        self.catalog_list(ProviderCall::ListSecurityGroups, |catalog| {
            &catalog.security_groups
        })
    }

    fn list_key_pairs(&self) -> ProviderFuture<'_, Vec<String>> {
        self.catalog_list(ProviderCall::ListKeyPairs, |catalog| &catalog.key_pairs)
    }

    fn list_roles(&self) -> ProviderFuture<'_, Vec<String>> {
        self.catalog_list(ProviderCall::ListRoles, |catalog| &catalog.roles)
    }

    fn list_load_balancers(&self) -> ProviderFuture<'_, Vec<String>> {
        self.catalog_list(ProviderCall::ListLoadBalancers, |catalog| {
            &catalog.load_balancers
        })
    }

    fn load_balancer_attribution(&self) -> ProviderFuture<'_, Vec<LoadBalancerMember>> {
        Box::pin(async move {
            self.record(ProviderCall::LoadBalancerAttribution)?;
            Ok(self.lock().members.clone())
        })
    }

    fn load_balancer_zones<'a>(&'a self, name: &'a str) -> ProviderFuture<'a, Vec<String>> {
        Box::pin(async move {
            self.record(ProviderCall::LoadBalancerZones)?;
            self.lock()
                .load_balancer_zones
                .get(name)
                .cloned()
                .ok_or_else(|| ProviderError::not_found("load balancer", name))
        })
    }

    fn resolve_image<'a>(
        &'a self,
        image: &'a str,
        zone: Option<&'a str>,
    ) -> ProviderFuture<'a, String> {
        Box::pin(async move {
            self.record(ProviderCall::ResolveImage)?;
            let mut state = self.lock();
            state
                .image_lookups
                .push((image.to_owned(), zone.map(str::to_owned)));
            Ok(state
                .images
                .get(image)
                .cloned()
                .unwrap_or_else(|| image.to_owned()))
        })
    }

    fn create_instances<'a>(&'a self, spec: &'a CreateSpec) -> ProviderFuture<'a, Vec<String>> {
        Box::pin(async move {
            self.record(ProviderCall::CreateInstances)?;
            Ok(self.create(spec))
        })
    }

    fn tag_resources<'a>(&'a self, ids: &'a [String], tags: &'a [Tag]) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.record(ProviderCall::TagResources)?;
            let mut state = self.lock();
            state.tags.push((ids.to_vec(), tags.to_vec()));
            let name = tags
                .iter()
                .find(|tag| tag.key == "Name")
                .map(|tag| InstanceName::parse(&tag.value));
            for instance in &mut state.instances {
                if ids.contains(&instance.id) && name.is_some() {
                    instance.name.clone_from(&name);
                }
            }
            Ok(())
        })
    }

    fn describe_boot_payload<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, Option<String>> {
        Box::pin(async move {
            self.record(ProviderCall::DescribeBootPayload)?;
            Ok(self.lock().boot_payloads.get(id).cloned())
        })
    }

    fn terminate_instance<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, InstanceState> {
        Box::pin(async move {
            self.record(ProviderCall::TerminateInstance)?;
            let mut state = self.lock();
            state.terminated.push(id.to_owned());
            Ok(state.terminate_state.unwrap_or(InstanceState::ShuttingDown))
        })
    }

    fn register_with_load_balancer<'a>(
        &'a self,
        name: &'a str,
        ids: &'a [String],
    ) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.record(ProviderCall::RegisterWithLoadBalancer)?;
            self.lock()
                .registrations
                .push((name.to_owned(), ids.to_vec()));
            Ok(())
        })
    }
}

/// How a [`ScriptedShell`] host behaves.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum HostBehaviour {
    /// Write `<host>\n` to stdout and exit 0.
    #[default]
    Echo,
    /// Exit with the given code without output.
    Exit(i32),
    /// Take this long to connect, then behave like [`HostBehaviour::Echo`].
    SlowConnect(Duration),
    /// Fail to connect.
    FailConnect,
    /// Connect, then fail while running the command.
    FailExec,
    /// Connect, then never finish.
    Hang,
}

/// Shell operations recorded by [`ScriptedShell`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ShellCall {
    /// A connection was requested.
    Connect(String),
    /// A command was started.
    Exec {
        /// Host the command ran on.
        host: String,
        /// Rendered command line.
        command: String,
    },
    /// A hanging session was dropped before finishing.
    Cancelled(String),
}

impl ShellCall {
    /// Shorthand for [`ShellCall::Connect`].
    #[must_use]
    pub fn connect(host: &str) -> Self {
        Self::Connect(host.to_owned())
    }

    /// Returns the host for [`ShellCall::Exec`] entries.
    #[must_use]
    pub fn exec_host(&self) -> Option<&str> {
        match self {
            Self::Exec { host, .. } => Some(host),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct ShellState {
    behaviours: HashMap<String, HostBehaviour>,
    log: Vec<ShellCall>,
}

/// Remote shell double that records connection and execution order.
#[derive(Clone, Debug, Default)]
pub struct ScriptedShell {
    state: Arc<Mutex<ShellState>>,
}

impl ScriptedShell {
    /// Creates a shell where every host echoes its name.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the behaviour of one host.
    pub fn on_host(&self, host: &str, behaviour: HostBehaviour) {
        lock_shell(&self.state)
            .behaviours
            .insert(host.to_owned(), behaviour);
    }

    /// Every recorded call in order.
    #[must_use]
    pub fn log(&self) -> Vec<ShellCall> {
        lock_shell(&self.state).log.clone()
    }

    /// Hosts that ran a command, in order.
    #[must_use]
    pub fn executed_hosts(&self) -> Vec<String> {
        self.log()
            .iter()
            .filter_map(ShellCall::exec_host)
            .map(str::to_owned)
            .collect()
    }
}

fn lock_shell(state: &Mutex<ShellState>) -> MutexGuard<'_, ShellState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RemoteShell for ScriptedShell {
    type Session = ScriptedSession;

    fn connect(&self, target: ShellTarget) -> ShellFuture<Self::Session> {
        let behaviour = {
            let mut state = lock_shell(&self.state);
            state.log.push(ShellCall::Connect(target.host.clone()));
            state
                .behaviours
                .get(&target.host)
                .cloned()
                .unwrap_or_default()
        };
        let shell = Arc::clone(&self.state);
        Box::pin(async move {
            if let HostBehaviour::SlowConnect(delay) = behaviour {
                tokio::time::sleep(delay).await;
            }
            if behaviour == HostBehaviour::FailConnect {
                return Err(ShellError::Connect {
                    host: target.host,
                    message: String::from("scripted connection refused"),
                });
            }
            Ok(ScriptedSession {
                host: target.host,
                behaviour,
                shell,
            })
        })
    }
}

/// Session handed out by [`ScriptedShell`].
#[derive(Debug)]
pub struct ScriptedSession {
    host: String,
    behaviour: HostBehaviour,
    shell: Arc<Mutex<ShellState>>,
}

struct CancelGuard {
    host: String,
    shell: Arc<Mutex<ShellState>>,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        lock_shell(&self.shell)
            .log
            .push(ShellCall::Cancelled(self.host.clone()));
    }
}

impl ShellSession for ScriptedSession {
    fn exec(self, command: String, sink: OutputSink) -> ShellFuture<Option<i32>> {
        lock_shell(&self.shell).log.push(ShellCall::Exec {
            host: self.host.clone(),
            command,
        });
        Box::pin(async move {
            match self.behaviour {
                HostBehaviour::Echo
                | HostBehaviour::SlowConnect(_)
                | HostBehaviour::FailConnect => {
                    sink.stdout(format!("{}\n", self.host).as_bytes());
                    Ok(Some(0))
                }
                HostBehaviour::Exit(code) => Ok(Some(code)),
                HostBehaviour::FailExec => Err(ShellError::Session {
                    host: self.host,
                    message: String::from("scripted channel failure"),
                }),
                HostBehaviour::Hang => {
                    let _guard = CancelGuard {
                        host: self.host,
                        shell: self.shell,
                    };
                    std::future::pending().await
                }
            }
        })
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: AsyncMutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets environment variables while holding a global mutex. Pairs with
    /// a `None` value are removed for the guard's lifetime.
    pub async fn set_vars(pairs: &[(&str, Option<&str>)]) -> Self {
        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            previous.push(((*key).to_owned(), env::var_os(key)));
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe {
                match value {
                    Some(set) => env::set_var(key, set),
                    None => env::remove_var(key),
                }
            }
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in self.previous.iter().rev() {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
