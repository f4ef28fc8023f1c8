// In-crate test doubles for the provisioner's seams.
//
// Same approach as a stub connector: production code depends on the trait, tests hand in a
// recording fake.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::io::{Cursor, Write};
use std::sync::Mutex;
use url::Url;

use crate::installation::fetch::Fetcher;
use crate::installation::firewall::{FirewallManager, FirewallRule};
use crate::installation::service::{ServiceDefinition, ServiceManager, ServiceSetting, ServiceState};
use crate::installation::{CommandOutput, CommandRunner, CommandSpec};

// ---------------------------------------------------------------------------------------------
// Fetcher
// ---------------------------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeFetcher {
    responses: HashMap<String, std::result::Result<Vec<u8>, String>>,
    requested: Mutex<Vec<String>>,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, url: &str, body: Vec<u8>) -> Self {
        self.responses.insert(normalize(url), Ok(body));
        self
    }

    pub fn fail(mut self, url: &str, message: &str) -> Self {
        self.responses.insert(normalize(url), Err(message.to_string()));
        self
    }

    pub fn requested(&self) -> Vec<String> {
        self.requested.lock().unwrap().clone()
    }
}

fn normalize(url: &str) -> String {
    Url::parse(url).map(|u| u.to_string()).unwrap_or_else(|_| url.to_string())
}

#[async_trait]
impl Fetcher for FakeFetcher {
    async fn get_bytes(&self, url: &Url) -> Result<Vec<u8>> {
        self.requested.lock().unwrap().push(url.to_string());
        match self.responses.get(url.as_str()) {
            Some(Ok(body)) => Ok(body.clone()),
            Some(Err(msg)) => Err(anyhow::anyhow!("{}", msg)),
            None => Err(anyhow::anyhow!("connection refused: {}", url)),
        }
    }
}

// ---------------------------------------------------------------------------------------------
// Command runner
// ---------------------------------------------------------------------------------------------

type Matcher = Box<dyn Fn(&CommandSpec) -> bool + Send + Sync>;
type Action = Box<dyn Fn(&CommandSpec) -> Result<CommandOutput> + Send + Sync>;

/// Scripted runner. First matching rule wins; unmatched commands exit 0 with no output.
#[derive(Default)]
pub struct FakeRunner {
    rules: Vec<(Matcher, Action)>,
    calls: Mutex<Vec<CommandSpec>>,
}

pub fn output(exit_code: i32, stdout: &str, stderr: &str) -> CommandOutput {
    CommandOutput {
        exit_code: Some(exit_code),
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
        duration_ms: 0,
    }
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(
        mut self,
        matcher: impl Fn(&CommandSpec) -> bool + Send + Sync + 'static,
        action: impl Fn(&CommandSpec) -> Result<CommandOutput> + Send + Sync + 'static,
    ) -> Self {
        self.rules.push((Box::new(matcher), Box::new(action)));
        self
    }

    pub fn exit_code_when(self, needle: &str, code: i32) -> Self {
        let needle = needle.to_string();
        self.on(
            move |s| s.display().contains(&needle),
            move |_| Ok(output(code, "", "simulated failure")),
        )
    }

    pub fn stdout_when(self, needle: &str, stdout: &str) -> Self {
        let needle = needle.to_string();
        let stdout = stdout.to_string();
        self.on(
            move |s| s.display().contains(&needle),
            move |_| Ok(output(0, &stdout, "")),
        )
    }

    pub fn fail_spawn_when(self, needle: &str) -> Self {
        let needle = needle.to_string();
        self.on(
            move |s| s.display().contains(&needle),
            |s| Err(anyhow::anyhow!("Failed to spawn command '{}'", s.program)),
        )
    }

    /// Any command carrying `flag <path>` writes `bytes` to `<path>` (mimics a packager).
    pub fn writes_output_arg_after(self, flag: &str, bytes: &[u8]) -> Self {
        let flag = flag.to_string();
        let flag2 = flag.clone();
        let bytes = bytes.to_vec();
        self.on(
            move |s| s.args.iter().any(|a| *a == flag),
            move |s| {
                let idx = s.args.iter().position(|a| *a == flag2).unwrap();
                std::fs::write(&s.args[idx + 1], &bytes)?;
                Ok(output(0, "", ""))
            },
        )
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_lines(&self) -> Vec<String> {
        self.calls().iter().map(|c| c.display()).collect()
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(spec.clone());
        for (matcher, action) in &self.rules {
            if matcher(spec) {
                return action(spec);
            }
        }
        Ok(output(0, "", ""))
    }
}

// ---------------------------------------------------------------------------------------------
// Service manager
// ---------------------------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ServiceFakeState {
    registered: bool,
    calls: Vec<String>,
    definition: Option<ServiceDefinition>,
    applied: Vec<ServiceSetting>,
}

#[derive(Debug)]
pub struct FakeServiceManager {
    state: Mutex<ServiceFakeState>,
    status_after_start: ServiceState,
    failing_settings: BTreeSet<&'static str>,
    register_fails: bool,
}

impl FakeServiceManager {
    /// Nothing registered; the service runs after start.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ServiceFakeState::default()),
            status_after_start: ServiceState::Running,
            failing_settings: BTreeSet::new(),
            register_fails: false,
        }
    }

    pub fn already_registered(self) -> Self {
        self.state.lock().unwrap().registered = true;
        self
    }

    pub fn reports(mut self, state: ServiceState) -> Self {
        self.status_after_start = state;
        self
    }

    pub fn failing_setting(mut self, kind: &'static str) -> Self {
        self.failing_settings.insert(kind);
        self
    }

    pub fn failing_register(mut self) -> Self {
        self.register_fails = true;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn applied(&self) -> Vec<ServiceSetting> {
        self.state.lock().unwrap().applied.clone()
    }

    pub fn definition(&self) -> Option<ServiceDefinition> {
        self.state.lock().unwrap().definition.clone()
    }
}

#[async_trait]
impl ServiceManager for FakeServiceManager {
    fn backend(&self) -> &'static str {
        "fake"
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(format!("exists {}", name));
        Ok(st.registered)
    }

    async fn register(&self, def: &ServiceDefinition) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(format!("register {}", def.name));
        if self.register_fails {
            anyhow::bail!("access denied");
        }
        st.registered = true;
        st.definition = Some(def.clone());
        Ok(())
    }

    async fn apply(&self, name: &str, setting: &ServiceSetting) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(format!("apply {} {}", name, setting.kind()));
        if self.failing_settings.contains(setting.kind()) {
            anyhow::bail!("simulated {} failure", setting.kind());
        }
        st.applied.push(setting.clone());
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.state.lock().unwrap().calls.push(format!("start {}", name));
        Ok(())
    }

    async fn status(&self, name: &str) -> Result<ServiceState> {
        self.state.lock().unwrap().calls.push(format!("status {}", name));
        Ok(self.status_after_start.clone())
    }

    fn removal_hint(&self, name: &str) -> String {
        format!("fake-remove {}", name)
    }

    fn start_hint(&self, name: &str) -> String {
        format!("fake-start {}", name)
    }
}

// ---------------------------------------------------------------------------------------------
// Firewall
// ---------------------------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct FakeFirewall {
    existing: Mutex<BTreeSet<String>>,
    added: Mutex<Vec<FirewallRule>>,
    broken: bool,
}

impl FakeFirewall {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rule(self, name: &str) -> Self {
        self.existing.lock().unwrap().insert(name.to_string());
        self
    }

    /// Every operation fails (firewall service unavailable).
    pub fn broken(mut self) -> Self {
        self.broken = true;
        self
    }

    pub fn added(&self) -> Vec<FirewallRule> {
        self.added.lock().unwrap().clone()
    }
}

#[async_trait]
impl FirewallManager for FakeFirewall {
    async fn rule_exists(&self, name: &str) -> Result<bool> {
        if self.broken {
            anyhow::bail!("firewall service is not running");
        }
        Ok(self.existing.lock().unwrap().contains(name))
    }

    async fn add_rule(&self, rule: &FirewallRule) -> Result<()> {
        if self.broken {
            anyhow::bail!("firewall service is not running");
        }
        self.existing.lock().unwrap().insert(rule.name.clone());
        self.added.lock().unwrap().push(rule.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------------------------
// Archives
// ---------------------------------------------------------------------------------------------

/// Build an in-memory zip. Entry names ending in `/` become directories.
pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::FileOptions::default();
    for (name, body) in entries {
        if name.ends_with('/') {
            zip.add_directory(*name, options).unwrap();
        } else {
            zip.start_file(*name, options).unwrap();
            zip.write_all(body).unwrap();
        }
    }
    zip.finish().unwrap().into_inner()
}
