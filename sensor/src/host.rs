use std::{
    cell::RefCell,
    collections::{BTreeMap, HashMap},
    io::ErrorKind,
    net::{Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    rc::Rc,
    sync::{mpsc, OnceLock},
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::{rejection::FormRejection, Form, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri},
    response::IntoResponse,
    Router,
};
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use thermometer_common::{
    AccessPointSettings, BootClassifier, BootConfig, HttpMethod, HttpRequest, HttpResponse,
    HttpServer, IncomingRequest, KeyValueStore, NetError, NetworkCredentials, NetworkServices,
    ProbeConfig, ProvisioningConfig, ProvisioningController, RequestId, RetainedBootMemory,
    RetainedRegion, SharedRetained, StoreError, StoredValue, System, WifiRadio,
};

use crate::{
    app::{Device, SharedProbe, TemperatureProbe},
    dns::UdpCaptiveDns,
};

const RETAINED_ENV: &str = "THERMOMETER_RETAINED";
const SIMULATED_ASSOCIATION_MS: u64 = 1_000;
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

struct HostConfig {
    data_dir: PathBuf,
    http_port: u16,
    dns_port: u16,
    networks: Vec<NetworkCredentials>,
    stable_after_ms: Option<u64>,
    link_drop_after_ms: Option<u64>,
}

impl HostConfig {
    fn from_env() -> Self {
        let data_dir = std::env::var("THERMOMETER_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.thermometer"));

        Self {
            data_dir,
            http_port: env_parse("THERMOMETER_HTTP_PORT").unwrap_or(8080),
            dns_port: env_parse("THERMOMETER_DNS_PORT").unwrap_or(5353),
            networks: std::env::var("THERMOMETER_SIM_NETWORKS")
                .map(|value| parse_networks(&value))
                .unwrap_or_default(),
            stable_after_ms: env_parse("THERMOMETER_STABLE_AFTER_MS"),
            link_drop_after_ms: env_parse("THERMOMETER_SIM_LINK_DROP_MS"),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<T>().ok())
}

/// `ssid:pass,ssid2:pass2`. A missing `:` means an open network.
fn parse_networks(value: &str) -> Vec<NetworkCredentials> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (ssid, password) = entry.split_once(':').unwrap_or((entry, ""));
            NetworkCredentials {
                ssid: ssid.to_string(),
                password: password.to_string(),
            }
        })
        .collect()
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = HostConfig::from_env();
    let retained = SharedRetained::new(decode_retained(std::env::var(RETAINED_ENV).ok()));
    let runtime = tokio::runtime::Handle::current();

    tokio::task::spawn_blocking(move || run_device(config, retained, runtime))
        .await
        .context("device loop panicked")?
}

fn run_device(
    config: HostConfig,
    retained: SharedRetained,
    runtime: tokio::runtime::Handle,
) -> anyhow::Result<()> {
    let mut boot_config = BootConfig::default();
    if let Some(stable_after_ms) = config.stable_after_ms {
        boot_config.stable_after_ms = stable_after_ms;
    }
    let portal_config = ProvisioningConfig {
        dns_port: config.dns_port,
        ..ProvisioningConfig::default()
    };

    let boot_store = FileKvStore::open(&config.data_dir, &boot_config.namespace)
        .context("failed to open boot store")?;
    let wifi_store = FileKvStore::open(&config.data_dir, &portal_config.namespace)
        .context("failed to open wifi store")?;

    let system = HostSystem {
        retained: retained.clone(),
    };
    let services = NetworkServices {
        radio: Box::new(SimulatedRadio::new(
            config.networks,
            config.link_drop_after_ms.map(Duration::from_millis),
        )),
        http: Box::new(AxumHttpServer::new(config.http_port, runtime)),
        dns: Box::new(UdpCaptiveDns::new()),
    };
    let probe: SharedProbe = Rc::new(RefCell::new(SimulatedProbe::default()));

    let mut device = Device {
        boot: BootClassifier::new(boot_config, Box::new(boot_store), Box::new(retained)),
        portal: ProvisioningController::new(
            portal_config,
            Box::new(wifi_store),
            services,
            Box::new(system.clone()),
        ),
        probe,
        probe_config: ProbeConfig::default(),
        system: Box::new(system),
    };

    device.start();
    device.run(|| {})
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// One JSON document per namespace under the data dir.
struct FileKvStore {
    namespace: String,
    path: PathBuf,
    entries: BTreeMap<String, StoredValue>,
}

impl FileKvStore {
    fn open(data_dir: &Path, namespace: &str) -> anyhow::Result<Self> {
        let path = data_dir.join(format!("{namespace}.json"));
        let entries = match std::fs::read(&path) {
            Ok(raw) => serde_json::from_slice(&raw).unwrap_or_else(|err| {
                warn!("{}: unreadable store, starting empty: {err}", path.display());
                BTreeMap::new()
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()))
            }
        };

        Ok(Self {
            namespace: namespace.to_string(),
            path,
            entries,
        })
    }

    fn get(&self, key: &str) -> Option<&StoredValue> {
        self.entries.get(key)
    }

    fn flush(&self) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| StoreError::Backend(err.to_string()))?;
        }
        let payload = serde_json::to_vec_pretty(&self.entries)
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        std::fs::write(&self.path, payload).map_err(|err| StoreError::Backend(err.to_string()))
    }

    fn put(&mut self, key: &str, value: StoredValue) -> Result<(), StoreError> {
        self.entries.insert(key.to_string(), value);
        self.flush()
    }
}

impl KeyValueStore for FileKvStore {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn get_u8(&self, key: &str) -> Result<Option<u8>, StoreError> {
        match self.get(key) {
            None => Ok(None),
            Some(StoredValue::U8(value)) => Ok(Some(*value)),
            Some(_) => Err(StoreError::TypeMismatch {
                key: key.to_string(),
            }),
        }
    }

    fn get_bool(&self, key: &str) -> Result<Option<bool>, StoreError> {
        match self.get(key) {
            None => Ok(None),
            Some(StoredValue::Bool(value)) => Ok(Some(*value)),
            Some(_) => Err(StoreError::TypeMismatch {
                key: key.to_string(),
            }),
        }
    }

    fn get_str(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.get(key) {
            None => Ok(None),
            Some(StoredValue::Str(value)) => Ok(Some(value.clone())),
            Some(_) => Err(StoreError::TypeMismatch {
                key: key.to_string(),
            }),
        }
    }

    fn put_u8(&mut self, key: &str, value: u8) -> Result<(), StoreError> {
        self.put(key, StoredValue::U8(value))
    }

    fn put_bool(&mut self, key: &str, value: bool) -> Result<(), StoreError> {
        self.put(key, StoredValue::Bool(value))
    }

    fn put_str(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.put(key, StoredValue::Str(value.to_string()))
    }

    fn remove(&mut self, key: &str) -> Result<bool, StoreError> {
        if self.entries.remove(key).is_none() {
            return Ok(false);
        }
        self.flush()?;
        Ok(true)
    }
}

fn encode_retained(value: RetainedBootMemory) -> String {
    format!("{:08x}:{}", value.magic, value.soft_boot_count)
}

/// Anything missing or malformed reads as a zeroed region, like a cold power-on.
fn decode_retained(raw: Option<String>) -> RetainedBootMemory {
    let Some(raw) = raw else {
        return RetainedBootMemory::default();
    };
    let parsed = raw.split_once(':').and_then(|(magic, count)| {
        Some(RetainedBootMemory {
            magic: u32::from_str_radix(magic, 16).ok()?,
            soft_boot_count: count.parse().ok()?,
        })
    });
    parsed.unwrap_or_default()
}

#[derive(Clone)]
struct HostSystem {
    retained: SharedRetained,
}

impl System for HostSystem {
    fn now_ms(&self) -> u64 {
        monotonic_ms()
    }

    fn sleep_ms(&self, ms: u64) {
        std::thread::sleep(Duration::from_millis(ms));
    }

    /// Re-executes the binary, handing the retained region to the new process.
    fn restart(&self) {
        let exe = match std::env::current_exe() {
            Ok(exe) => exe,
            Err(err) => {
                error!("restart failed, cannot locate executable: {err}");
                std::process::exit(1);
            }
        };
        let mut command = std::process::Command::new(exe);
        command
            .args(std::env::args_os().skip(1))
            .env(RETAINED_ENV, encode_retained(self.retained.load()));

        info!("restarting");
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            let err = command.exec();
            error!("restart failed: {err}");
            std::process::exit(1);
        }
        #[cfg(not(unix))]
        {
            if let Err(err) = command.spawn() {
                error!("restart failed: {err}");
                std::process::exit(1);
            }
            std::process::exit(0);
        }
    }
}

/// Joins only the networks listed in `THERMOMETER_SIM_NETWORKS`, after a short
/// simulated association delay.
/// Joins any network listed in `networks` after a fixed association delay.
/// With `link_drop_after` set, an established link is lost after that long.
struct SimulatedRadio {
    networks: Vec<NetworkCredentials>,
    joining: Option<(NetworkCredentials, Instant)>,
    access_point: Option<Ipv4Addr>,
    auto_reconnect: bool,
    link_drop_after: Option<Duration>,
}

impl SimulatedRadio {
    fn new(networks: Vec<NetworkCredentials>, link_drop_after: Option<Duration>) -> Self {
        Self {
            networks,
            joining: None,
            access_point: None,
            auto_reconnect: false,
            link_drop_after,
        }
    }

    /// How long the link has been associated, if it is.
    fn link_uptime(&self) -> Option<Duration> {
        let (credentials, started) = self.joining.as_ref()?;
        if !self.networks.contains(credentials) {
            return None;
        }
        started
            .elapsed()
            .checked_sub(Duration::from_millis(SIMULATED_ASSOCIATION_MS))
    }

    /// Loses the association. In station mode the radio starts joining again.
    fn drop_link(&mut self) {
        if self.auto_reconnect {
            if let Some((credentials, started)) = self.joining.as_mut() {
                info!("sim radio: link to `{}` lost, reconnecting", credentials.ssid);
                *started = Instant::now();
            }
        } else {
            self.joining = None;
        }
    }
}

impl WifiRadio for SimulatedRadio {
    fn begin_station(
        &mut self,
        hostname: &str,
        credentials: &NetworkCredentials,
    ) -> Result<(), NetError> {
        info!("sim radio: station `{hostname}` joining `{}`", credentials.ssid);
        self.access_point = None;
        self.auto_reconnect = true;
        self.joining = Some((credentials.clone(), Instant::now()));
        Ok(())
    }

    fn is_connected(&mut self) -> bool {
        let Some(uptime) = self.link_uptime() else {
            return false;
        };
        if self.link_drop_after.is_some_and(|limit| uptime >= limit) {
            self.drop_link();
            return false;
        }
        true
    }

    fn station_ip(&self) -> Option<Ipv4Addr> {
        self.link_uptime().map(|_| Ipv4Addr::LOCALHOST)
    }

    fn start_access_point(&mut self, settings: &AccessPointSettings) -> Result<Ipv4Addr, NetError> {
        info!(
            "sim radio: access point `{}` on {}/{}",
            settings.ssid, settings.ip, settings.netmask
        );
        self.auto_reconnect = false;
        self.joining = None;
        self.access_point = Some(settings.ip);
        Ok(settings.ip)
    }

    fn access_point_ip(&self) -> Option<Ipv4Addr> {
        self.access_point
    }
}

type Exchange = (HttpRequest, oneshot::Sender<HttpResponse>);

#[derive(Clone)]
struct ForwardState {
    requests: mpsc::Sender<Exchange>,
}

/// Axum front end. Handlers forward each request to the device thread and
/// await its answer.
struct AxumHttpServer {
    port: u16,
    runtime: tokio::runtime::Handle,
    requests_tx: mpsc::Sender<Exchange>,
    requests_rx: mpsc::Receiver<Exchange>,
    pending: HashMap<RequestId, oneshot::Sender<HttpResponse>>,
    next_id: RequestId,
}

impl AxumHttpServer {
    fn new(port: u16, runtime: tokio::runtime::Handle) -> Self {
        let (requests_tx, requests_rx) = mpsc::channel();
        Self {
            port,
            runtime,
            requests_tx,
            requests_rx,
            pending: HashMap::new(),
            next_id: 0,
        }
    }
}

impl HttpServer for AxumHttpServer {
    fn begin(&mut self) -> Result<(), NetError> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port));
        let listener = std::net::TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;

        let app = Router::new().fallback(forward).with_state(ForwardState {
            requests: self.requests_tx.clone(),
        });

        self.runtime.spawn(async move {
            let listener = match tokio::net::TcpListener::from_std(listener) {
                Ok(listener) => listener,
                Err(err) => {
                    error!("http listener setup failed: {err}");
                    return;
                }
            };
            if let Err(err) = axum::serve(listener, app).await {
                error!("http server stopped: {err}");
            }
        });

        info!("http listening on http://{addr}");
        Ok(())
    }

    fn next_request(&mut self) -> Option<IncomingRequest> {
        let (request, reply) = self.requests_rx.try_recv().ok()?;
        self.next_id = self.next_id.wrapping_add(1);
        self.pending.insert(self.next_id, reply);
        Some(IncomingRequest {
            id: self.next_id,
            request,
        })
    }

    fn respond(&mut self, id: RequestId, response: HttpResponse) {
        match self.pending.remove(&id) {
            Some(reply) => {
                if reply.send(response).is_err() {
                    warn!("http client for request {id} went away");
                }
            }
            None => warn!("no pending http request with id {id}"),
        }
    }
}

async fn forward(
    State(state): State<ForwardState>,
    method: Method,
    uri: Uri,
    form: Result<Form<HashMap<String, String>>, FormRejection>,
) -> axum::response::Response {
    let mut request = HttpRequest::new(HttpMethod::parse(method.as_str()), uri.path());
    if let Ok(Form(fields)) = form {
        request.fields.extend(fields);
    }

    let (reply_tx, reply_rx) = oneshot::channel();
    if state.requests.send((request, reply_tx)).is_err() {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "device loop stopped");
    }

    match tokio::time::timeout(RESPONSE_TIMEOUT, reply_rx).await {
        Ok(Ok(response)) => into_axum_response(response),
        _ => error_response(StatusCode::GATEWAY_TIMEOUT, "device did not answer"),
    }
}

fn into_axum_response(response: HttpResponse) -> axum::response::Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut headers = HeaderMap::new();
    headers.insert(
        axum::http::header::CONTENT_TYPE,
        HeaderValue::from_static(response.content_type),
    );
    for (name, value) in &response.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!("dropping invalid response header `{name}`"),
        }
    }
    (status, headers, response.body).into_response()
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (status, message.to_string()).into_response()
}

/// Drifts between 20.0 and 21.4 °C.
#[derive(Default)]
struct SimulatedProbe {
    tick: u64,
}

impl TemperatureProbe for SimulatedProbe {
    fn read_celsius(&mut self) -> Option<f32> {
        self.tick = self.tick.saturating_add(1);
        Some(20.0 + (self.tick % 8) as f32 * 0.2)
    }
}
