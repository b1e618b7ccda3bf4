use core::convert::TryInto;
use std::{
    cell::RefCell,
    collections::HashMap,
    net::Ipv4Addr,
    rc::Rc,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use ds18b20::{Ds18b20, Resolution};
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::Ets,
    gpio::{AnyIOPin, IOPin, InputOutput, PinDriver, Pull},
};
use esp_idf_svc::{
    eventloop::{EspSubscription, EspSystemEventLoop, System as EventLoopSystem},
    hal::{modem::Modem, prelude::Peripherals},
    http::server::{Configuration as HttpConfiguration, EspHttpConnection, EspHttpServer, Request},
    ipv4::{Configuration as IpConfiguration, Mask, RouterConfiguration, Subnet},
    log::EspLogger,
    netif::{EspNetif, NetifConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    sys::EspError,
    wifi::{EspWifi, WifiEvent},
};
use log::{info, warn};
use one_wire_bus::{Address, OneWire};

use thermometer_common::{
    decode_form, AccessPointSettings, BootClassifier, BootConfig, HttpMethod, HttpRequest,
    HttpResponse, HttpServer, IncomingRequest, KeyValueStore, NetError, NetworkCredentials,
    NetworkServices, ProbeConfig, ProvisioningConfig, ProvisioningController, RequestId,
    RetainedBootMemory, RetainedRegion, StoreError, System, WifiRadio,
};

use crate::{
    app::{Device, SharedProbe, TemperatureProbe},
    dns::UdpCaptiveDns,
};

const DS18B20_PIN: i32 = 4;
const MAX_HTTP_BODY: usize = 4096;
const MAX_NVS_STR: usize = 128;
const WATCHDOG_TIMEOUT_SEC: u32 = 90;
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();
    info!("reset reason: {}", reset_reason());

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let Peripherals { modem, pins, .. } = Peripherals::take()?;

    let boot_config = BootConfig::default();
    let portal_config = ProvisioningConfig::default();

    let boot_store = NvsKvStore::open(nvs_partition.clone(), &boot_config.namespace)
        .context("failed to open boot namespace")?;
    let wifi_store = NvsKvStore::open(nvs_partition, &portal_config.namespace)
        .context("failed to open wifi namespace")?;

    let probe = Ds18b20Probe::new(pins.gpio4.downgrade()).context("failed to initialize DS18B20")?;
    let probe: SharedProbe = Rc::new(RefCell::new(probe));

    let services = NetworkServices {
        radio: Box::new(EspRadio::new(modem, sys_loop).context("wifi driver init failed")?),
        http: Box::new(EspHttp::new()),
        dns: Box::new(UdpCaptiveDns::new()),
    };

    let mut device = Device {
        boot: BootClassifier::new(boot_config, Box::new(boot_store), Box::new(RtcRetained)),
        portal: ProvisioningController::new(
            portal_config,
            Box::new(wifi_store),
            services,
            Box::new(EspSystem),
        ),
        probe,
        probe_config: ProbeConfig::default(),
        system: Box::new(EspSystem),
    };

    device.start();
    disable_wifi_power_save();

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    add_current_task_to_watchdog()?;

    device.run(feed_watchdog)
}

fn reset_reason() -> &'static str {
    use esp_idf_svc::sys;

    match unsafe { sys::esp_reset_reason() } {
        sys::esp_reset_reason_t_ESP_RST_POWERON => "power-on",
        sys::esp_reset_reason_t_ESP_RST_EXT => "external pin",
        sys::esp_reset_reason_t_ESP_RST_SW => "software",
        sys::esp_reset_reason_t_ESP_RST_PANIC => "panic",
        sys::esp_reset_reason_t_ESP_RST_INT_WDT => "interrupt watchdog",
        sys::esp_reset_reason_t_ESP_RST_TASK_WDT => "task watchdog",
        sys::esp_reset_reason_t_ESP_RST_WDT => "watchdog",
        sys::esp_reset_reason_t_ESP_RST_DEEPSLEEP => "deep sleep",
        sys::esp_reset_reason_t_ESP_RST_BROWNOUT => "brownout",
        _ => "unknown",
    }
}

fn backend_error(err: EspError) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn driver_error(err: EspError) -> NetError {
    NetError::Driver(err.to_string())
}

/// One NVS namespace. Booleans are stored as `u8`.
struct NvsKvStore {
    namespace: String,
    nvs: EspNvs<NvsDefault>,
}

impl NvsKvStore {
    fn open(partition: EspDefaultNvsPartition, namespace: &str) -> anyhow::Result<Self> {
        let nvs = EspNvs::new(partition, namespace, true)?;
        Ok(Self {
            namespace: namespace.to_string(),
            nvs,
        })
    }
}

impl KeyValueStore for NvsKvStore {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn get_u8(&self, key: &str) -> Result<Option<u8>, StoreError> {
        self.nvs.get_u8(key).map_err(backend_error)
    }

    fn get_bool(&self, key: &str) -> Result<Option<bool>, StoreError> {
        Ok(self.get_u8(key)?.map(|value| value != 0))
    }

    fn get_str(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut buffer = [0_u8; MAX_NVS_STR];
        let value = self.nvs.get_str(key, &mut buffer).map_err(backend_error)?;
        Ok(value.map(str::to_string))
    }

    fn put_u8(&mut self, key: &str, value: u8) -> Result<(), StoreError> {
        self.nvs.set_u8(key, value).map_err(backend_error)
    }

    fn put_bool(&mut self, key: &str, value: bool) -> Result<(), StoreError> {
        self.put_u8(key, u8::from(value))
    }

    fn put_str(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.nvs.set_str(key, value).map_err(backend_error)
    }

    fn remove(&mut self, key: &str) -> Result<bool, StoreError> {
        self.nvs.remove(key).map_err(backend_error)
    }
}

// Lives in RTC slow memory, which the bootloader leaves untouched on warm resets.
#[link_section = ".rtc_noinit"]
static mut RTC_BOOT_MEMORY: RetainedBootMemory = RetainedBootMemory {
    magic: 0,
    soft_boot_count: 0,
};

struct RtcRetained;

impl RetainedRegion for RtcRetained {
    fn load(&self) -> RetainedBootMemory {
        unsafe { core::ptr::read_volatile(core::ptr::addr_of!(RTC_BOOT_MEMORY)) }
    }

    fn store(&mut self, value: RetainedBootMemory) {
        unsafe { core::ptr::write_volatile(core::ptr::addr_of_mut!(RTC_BOOT_MEMORY), value) }
    }
}

struct EspSystem;

impl System for EspSystem {
    fn now_ms(&self) -> u64 {
        monotonic_ms()
    }

    fn sleep_ms(&self, ms: u64) {
        thread::sleep(Duration::from_millis(ms));
    }

    fn restart(&self) {
        info!("restarting");
        unsafe { esp_idf_svc::sys::esp_restart() };
    }
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

struct EspRadio {
    wifi: EspWifi<'static>,
    access_point: Option<Ipv4Addr>,
    /// Set while in station mode; the disconnect handler rejoins only then.
    reconnect: Arc<AtomicBool>,
    _disconnects: EspSubscription<'static, EventLoopSystem>,
}

impl EspRadio {
    fn new(modem: Modem, sys_loop: EspSystemEventLoop) -> anyhow::Result<Self> {
        // No NVS partition: the driver must not persist its own copy of the credentials.
        let wifi = EspWifi::new(modem, sys_loop.clone(), None)?;

        let reconnect = Arc::new(AtomicBool::new(false));
        let disconnects = {
            let reconnect = reconnect.clone();
            sys_loop.subscribe::<WifiEvent, _>(move |event| {
                if matches!(event, WifiEvent::StaDisconnected(_))
                    && reconnect.load(Ordering::Relaxed)
                {
                    info!("wifi link lost, reconnecting");
                    if let Err(err) =
                        esp_idf_svc::sys::esp!(unsafe { esp_idf_svc::sys::esp_wifi_connect() })
                    {
                        warn!("wifi reconnect request failed: {err}");
                    }
                }
            })?
        };

        Ok(Self {
            wifi,
            access_point: None,
            reconnect,
            _disconnects: disconnects,
        })
    }
}

impl WifiRadio for EspRadio {
    fn begin_station(
        &mut self,
        hostname: &str,
        credentials: &NetworkCredentials,
    ) -> Result<(), NetError> {
        let auth_method = if credentials.password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };

        self.wifi
            .sta_netif_mut()
            .set_hostname(hostname)
            .map_err(driver_error)?;
        self.wifi
            .set_configuration(&Configuration::Client(ClientConfiguration {
                ssid: credentials
                    .ssid
                    .as_str()
                    .try_into()
                    .map_err(|_| NetError::TooLong("wifi ssid"))?,
                password: credentials
                    .password
                    .as_str()
                    .try_into()
                    .map_err(|_| NetError::TooLong("wifi password"))?,
                auth_method,
                ..Default::default()
            }))
            .map_err(driver_error)?;

        self.wifi.start().map_err(driver_error)?;
        self.reconnect.store(true, Ordering::Relaxed);
        self.wifi.connect().map_err(driver_error)?;
        info!("wifi started, connecting to `{}`", credentials.ssid);
        Ok(())
    }

    fn is_connected(&mut self) -> bool {
        self.wifi.is_connected().unwrap_or(false) && self.station_ip().is_some()
    }

    fn station_ip(&self) -> Option<Ipv4Addr> {
        let ip = self.wifi.sta_netif().get_ip_info().ok()?.ip;
        (!ip.is_unspecified()).then_some(ip)
    }

    fn start_access_point(&mut self, settings: &AccessPointSettings) -> Result<Ipv4Addr, NetError> {
        let mask = Mask::try_from(settings.netmask)
            .map_err(|_| NetError::Driver(format!("invalid netmask {}", settings.netmask)))?;

        // The router netif serves DHCP and DNS on its own address.
        let mut conf = NetifConfiguration::wifi_default_router();
        conf.ip_configuration = Some(IpConfiguration::Router(RouterConfiguration {
            subnet: Subnet {
                gateway: settings.ip,
                mask,
            },
            dhcp_enabled: true,
            dns: Some(settings.ip),
            secondary_dns: None,
        }));
        if settings.gateway != settings.ip {
            warn!(
                "AP gateway {} differs from AP address {}; serving on {}",
                settings.gateway, settings.ip, settings.ip
            );
        }

        self.reconnect.store(false, Ordering::Relaxed);
        let _ = self.wifi.disconnect();
        let _ = self.wifi.stop();

        let netif = EspNetif::new_with_conf(&conf).map_err(driver_error)?;
        self.wifi.swap_netif_ap(netif).map_err(driver_error)?;

        let auth_method = if settings.password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };
        self.wifi
            .set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
                ssid: settings
                    .ssid
                    .as_str()
                    .try_into()
                    .map_err(|_| NetError::TooLong("AP ssid"))?,
                password: settings
                    .password
                    .as_str()
                    .try_into()
                    .map_err(|_| NetError::TooLong("AP password"))?,
                auth_method,
                channel: 1,
                ..Default::default()
            }))
            .map_err(driver_error)?;
        self.wifi.start().map_err(driver_error)?;

        let ip = self
            .wifi
            .ap_netif()
            .get_ip_info()
            .map(|info| info.ip)
            .unwrap_or(settings.ip);
        self.access_point = Some(ip);
        Ok(ip)
    }

    fn access_point_ip(&self) -> Option<Ipv4Addr> {
        self.access_point
    }
}

type Exchange = (HttpRequest, mpsc::SyncSender<HttpResponse>);

/// Wildcard handlers on the httpd task queue requests for the control loop
/// and block until it answers.
struct EspHttp {
    server: Option<EspHttpServer<'static>>,
    requests_tx: mpsc::SyncSender<Exchange>,
    requests_rx: mpsc::Receiver<Exchange>,
    pending: HashMap<RequestId, mpsc::SyncSender<HttpResponse>>,
    next_id: RequestId,
}

impl EspHttp {
    fn new() -> Self {
        let (requests_tx, requests_rx) = mpsc::sync_channel(8);
        Self {
            server: None,
            requests_tx,
            requests_rx,
            pending: HashMap::new(),
            next_id: 0,
        }
    }
}

impl HttpServer for EspHttp {
    fn begin(&mut self) -> Result<(), NetError> {
        let conf = HttpConfiguration {
            stack_size: 16 * 1024,
            uri_match_wildcard: true,
            ..Default::default()
        };

        let mut server = EspHttpServer::new(&conf).map_err(driver_error)?;

        for method in [Method::Get, Method::Post, Method::Put, Method::Delete] {
            let requests = self.requests_tx.clone();
            server
                .fn_handler::<anyhow::Error, _>("/*", method, move |mut req| {
                    let body = read_request_body(&mut req)?;
                    let request = build_request(method, req.uri(), &body);

                    let (reply_tx, reply_rx) = mpsc::sync_channel(1);
                    requests
                        .send((request, reply_tx))
                        .map_err(|_| anyhow!("control loop stopped"))?;
                    let response = reply_rx
                        .recv_timeout(RESPONSE_TIMEOUT)
                        .unwrap_or_else(|_| HttpResponse::text(503, "Device busy"));
                    write_response(req, &response)
                })
                .map_err(driver_error)?;
        }

        self.server = Some(server);
        info!("http server started");
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
                    warn!("http handler for request {id} timed out");
                }
            }
            None => warn!("no pending http request with id {id}"),
        }
    }
}

fn build_request(method: Method, uri: &str, body: &[u8]) -> HttpRequest {
    let method = match method {
        Method::Get => HttpMethod::Get,
        Method::Post => HttpMethod::Post,
        Method::Put => HttpMethod::Put,
        Method::Delete => HttpMethod::Delete,
        _ => HttpMethod::Other,
    };
    let (path, query) = uri.split_once('?').unwrap_or((uri, ""));

    let mut request = HttpRequest::new(method, path);
    request.fields = decode_form(query);
    if !body.is_empty() {
        request
            .fields
            .extend(decode_form(&String::from_utf8_lossy(body)));
    }
    request
}

fn read_request_body(req: &mut Request<&mut EspHttpConnection<'_>>) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_response(
    req: Request<&mut EspHttpConnection<'_>>,
    response: &HttpResponse,
) -> anyhow::Result<()> {
    let mut headers = vec![
        ("Content-Type", response.content_type),
        ("Connection", "close"),
    ];
    headers.extend(
        response
            .headers
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str())),
    );

    req.into_response(response.status, None, &headers)?
        .write_all(response.body.as_bytes())?;
    Ok(())
}

/// First DS18B20 on the one-wire bus. The address is rescanned after any
/// failed read so a replugged probe is picked up again.
struct Ds18b20Probe {
    one_wire: OneWire<PinDriver<'static, AnyIOPin, InputOutput>>,
    address: Option<Address>,
    delay: Ets,
}

impl Ds18b20Probe {
    fn new(pin: AnyIOPin) -> anyhow::Result<Self> {
        let mut one_wire_pin = PinDriver::input_output_od(pin)?;
        one_wire_pin.set_pull(Pull::Up)?;
        one_wire_pin.set_high()?;

        let one_wire = OneWire::new(one_wire_pin)
            .map_err(|err| anyhow!("failed to initialize one-wire bus: {err:?}"))?;

        let mut probe = Self {
            one_wire,
            address: None,
            delay: Ets,
        };
        probe.scan();
        Ok(probe)
    }

    fn scan(&mut self) {
        let mut found: Option<Address> = None;
        let mut device_count = 0_u32;

        for addr in self.one_wire.devices(false, &mut self.delay) {
            match addr {
                Ok(address) => {
                    device_count = device_count.saturating_add(1);
                    if found.is_none() && address.family_code() == ds18b20::FAMILY_CODE {
                        found = Some(address);
                    }
                }
                Err(err) => {
                    warn!("one-wire device scan failed: {err:?}");
                    break;
                }
            }
        }

        self.address = found;
        match self.address {
            Some(address) => info!(
                "DS18B20 ready on GPIO{DS18B20_PIN} ({device_count} one-wire device(s), using {address:?})"
            ),
            None => warn!(
                "no DS18B20 found on GPIO{DS18B20_PIN} ({device_count} one-wire device(s) detected)"
            ),
        }
    }
}

impl TemperatureProbe for Ds18b20Probe {
    fn read_celsius(&mut self) -> Option<f32> {
        if self.address.is_none() {
            self.scan();
        }

        let address = self.address?;
        let sensor = match Ds18b20::new::<core::convert::Infallible>(address) {
            Ok(sensor) => sensor,
            Err(err) => {
                warn!("invalid DS18B20 address {address:?}: {err:?}");
                self.address = None;
                return None;
            }
        };

        if let Err(err) =
            ds18b20::start_simultaneous_temp_measurement(&mut self.one_wire, &mut self.delay)
        {
            warn!("failed to start DS18B20 conversion: {err:?}");
            self.address = None;
            return None;
        }

        Resolution::Bits12.delay_for_measurement_time(&mut self.delay);

        match sensor.read_data(&mut self.one_wire, &mut self.delay) {
            Ok(data) => Some(data.temperature),
            Err(err) => {
                warn!("failed to read DS18B20 data: {err:?}");
                self.address = None;
                None
            }
        }
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}
