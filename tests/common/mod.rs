#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::{Arc, Mutex};

use keel::config::{ConfigParser, DesiredConfiguration, KeelConfig};
use keel::error::ProvisionError;
use keel::provision::{
    DestroyRequest, EchoProvisioner, ProvisionOutput, ProvisionRequest, Provisioner,
    ProvisionerRegistry, StepResult,
};

/// `app` is declared before what it depends on.
const CONFIG: &str = r"
project:
  name: shop
provisioners:
  net: { driver: echo }
  k8s: { driver: echo }
  app: { driver: echo }
modules:
  - name: app
    kind: app
    inputs:
      endpoint: { from_output: cluster.endpoint }
      replicas: REPLICAS
    outputs: [url]
  - name: cluster
    kind: k8s
    inputs:
      vpc: { from_output: network.vpc_id }
    outputs: [endpoint]
  - name: dns
    kind: net
    depends_on: [network]
    inputs: { zone: shop.example }
    outputs: [zone_id]
  - name: network
    kind: net
    inputs: { cidr: CIDR }
    outputs: [vpc_id]
environments:
  - name: staging
    branch: develop
  - name: prod
    branch: main
    approval: manual
    approval_timeout_secs: 30
";

/// Network and DNS only.
const SHRUNK: &str = r"
project:
  name: shop
provisioners:
  net: { driver: echo }
modules:
  - name: dns
    kind: net
    depends_on: [network]
    inputs: { zone: shop.example }
    outputs: [zone_id]
  - name: network
    kind: net
    inputs: { cidr: CIDR }
    outputs: [vpc_id]
environments:
  - name: staging
    branch: develop
";

pub const KINDS: [&str; 3] = ["net", "k8s", "app"];

pub fn config(cidr: &str, replicas: u32) -> KeelConfig {
    let yaml = CONFIG
        .replace("CIDR", cidr)
        .replace("REPLICAS", &replicas.to_string());
    ConfigParser::new().parse_yaml(&yaml, None).expect("config parses")
}

pub fn shrunk_config(cidr: &str) -> KeelConfig {
    ConfigParser::new()
        .parse_yaml(&SHRUNK.replace("CIDR", cidr), None)
        .expect("config parses")
}

pub fn desired(config: &KeelConfig, environment: &str) -> DesiredConfiguration {
    DesiredConfiguration::for_environment(config, environment).expect("environment exists")
}

/// Echoes outputs and records every call as `apply:<module>` or
/// `destroy:<module>`.
#[derive(Clone, Default)]
pub struct Recorder {
    calls: Arc<Mutex<Vec<String>>>,
    fail_on: Arc<Mutex<Option<String>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(&self, module: &str) {
        *self.fail_on.lock().unwrap() = Some(module.to_string());
    }

    pub fn heal(&self) {
        *self.fail_on.lock().unwrap() = None;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn registry(&self) -> ProvisionerRegistry {
        let shared: Arc<dyn Provisioner> = Arc::new(self.clone());
        KINDS
            .into_iter()
            .fold(ProvisionerRegistry::new(), |registry, kind| {
                registry.with(kind, Arc::clone(&shared))
            })
    }
}

#[async_trait]
impl Provisioner for Recorder {
    async fn apply(&self, request: &ProvisionRequest) -> StepResult<ProvisionOutput> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("apply:{}", request.module));
        if self.fail_on.lock().unwrap().as_deref() == Some(request.module.as_str()) {
            return Err(ProvisionError::failed("quota exceeded"));
        }
        EchoProvisioner::new().apply(request).await
    }

    async fn destroy(&self, request: &DestroyRequest) -> StepResult<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("destroy:{}", request.module));
        Ok(())
    }

    fn driver(&self) -> &'static str {
        "recorder"
    }
}

/// Index of `call` in `calls`, panicking if absent.
pub fn position(calls: &[String], call: &str) -> usize {
    calls
        .iter()
        .position(|c| c == call)
        .unwrap_or_else(|| panic!("{call} missing from {calls:?}"))
}
