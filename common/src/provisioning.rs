//! Network provisioning: join the stored network or fall back to a setup
//! access point with a captive portal.
//!
//! The mode chosen by [`ProvisioningController::begin`] holds until the next
//! restart. Saving new credentials through the portal persists them and
//! performs a warm restart, so the next boot retries the join.

use std::net::Ipv4Addr;

use log::{info, warn};

use crate::{
    config::ProvisioningConfig,
    http::{HttpMethod, HttpRequest, HttpResponse, HttpServer},
    pages,
    platform::{AccessPointSettings, CaptiveDns, System, WifiRadio},
    router::{PortalRoute, Router, Target},
    storage::KeyValueStore,
    types::{NetworkCredentials, ProvisioningMode},
};

const MIN_PASSWORD_CHARS: usize = 8;

pub struct NetworkServices {
    pub radio: Box<dyn WifiRadio>,
    pub http: Box<dyn HttpServer>,
    pub dns: Box<dyn CaptiveDns>,
}

pub struct ProvisioningController {
    config: ProvisioningConfig,
    store: Box<dyn KeyValueStore>,
    radio: Box<dyn WifiRadio>,
    http: Box<dyn HttpServer>,
    dns: Box<dyn CaptiveDns>,
    system: Box<dyn System>,
    router: Router,

    mode: ProvisioningMode,
    dns_running: bool,
}

struct Handled {
    response: HttpResponse,
    restart: bool,
}

impl Handled {
    fn respond(response: HttpResponse) -> Self {
        Self {
            response,
            restart: false,
        }
    }
}

impl ProvisioningController {
    pub fn new(
        config: ProvisioningConfig,
        store: Box<dyn KeyValueStore>,
        services: NetworkServices,
        system: Box<dyn System>,
    ) -> Self {
        Self {
            config,
            store,
            radio: services.radio,
            http: services.http,
            dns: services.dns,
            system,
            router: Router::new(),
            mode: ProvisioningMode::Ap,
            dns_running: false,
        }
    }

    pub fn mode(&self) -> ProvisioningMode {
        self.mode
    }

    pub fn is_ap_mode(&self) -> bool {
        self.mode == ProvisioningMode::Ap
    }

    pub fn is_sta_mode(&self) -> bool {
        self.mode == ProvisioningMode::Sta
    }

    pub fn hostname(&self) -> &str {
        &self.config.hostname
    }

    pub fn station_ip(&self) -> Option<Ipv4Addr> {
        self.radio.station_ip()
    }

    pub fn access_point_ip(&self) -> Option<Ipv4Addr> {
        self.radio.access_point_ip()
    }

    /// Address clients should use to reach this device in the current mode.
    pub fn current_ip(&self) -> Option<Ipv4Addr> {
        match self.mode {
            ProvisioningMode::Sta => self.station_ip(),
            ProvisioningMode::Ap => self.access_point_ip(),
        }
    }

    /// Route table served by this controller's HTTP server; application
    /// endpoints are registered here.
    pub fn router_mut(&mut self) -> &mut Router {
        &mut self.router
    }

    pub fn saved_ssid(&self) -> Option<String> {
        let ssid = self.store.str_or(&self.config.key_ssid, "");
        (!ssid.is_empty()).then_some(ssid)
    }

    pub fn saved_credentials(&self) -> Option<NetworkCredentials> {
        let ssid = self.saved_ssid()?;
        Some(NetworkCredentials {
            ssid,
            password: self.store.str_or(&self.config.key_pass, ""),
        })
    }

    pub fn begin(&mut self) -> ProvisioningMode {
        self.register_common_routes();

        if let Some(credentials) = self.saved_credentials() {
            if self.join_station(&credentials) {
                self.mode = ProvisioningMode::Sta;
                self.start_http();
                return self.mode;
            }
        } else {
            info!("provisioning: no saved credentials");
        }

        self.mode = ProvisioningMode::Ap;
        self.start_access_point_portal();
        self.register_ap_routes();
        self.start_http();
        self.mode
    }

    pub fn tick(&mut self) {
        while let Some(incoming) = self.http.next_request() {
            let handled = self.dispatch(&incoming.request);
            self.http.respond(incoming.id, handled.response);

            if handled.restart {
                info!(
                    "provisioning: restarting in {}ms to apply credentials",
                    self.config.restart_delay_ms
                );
                self.system.sleep_ms(self.config.restart_delay_ms);
                self.system.restart();
            }
        }

        if self.mode == ProvisioningMode::Ap && self.dns_running {
            if let Err(err) = self.dns.process_next_request() {
                warn!("provisioning: captive dns error: {err}");
            }
        }
    }

    /// Removes stored credentials. Restarting and clearing the boot window
    /// are up to the caller.
    pub fn factory_reset_wifi(&mut self) {
        for key in [&self.config.key_ssid, &self.config.key_pass] {
            if let Err(err) = self.store.remove(key) {
                warn!("provisioning: failed to clear `{key}`: {err}");
            }
        }
        info!("provisioning: wifi credentials cleared");
    }

    fn join_station(&mut self, credentials: &NetworkCredentials) -> bool {
        info!("provisioning: joining `{}`", credentials.ssid);

        if let Err(err) = self
            .radio
            .begin_station(&self.config.hostname, credentials)
        {
            warn!("provisioning: station start failed: {err}");
            return false;
        }

        let started = self.system.now_ms();
        while !self.radio.is_connected()
            && self.system.now_ms().saturating_sub(started) < self.config.sta_connect_timeout_ms
        {
            self.system.sleep_ms(self.config.join_poll_interval_ms);
        }

        if self.radio.is_connected() {
            let ip = self
                .radio
                .station_ip()
                .map(|ip| ip.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            info!("provisioning: joined `{}`, ip {ip}", credentials.ssid);
            true
        } else {
            warn!(
                "provisioning: join `{}` timed out after {}ms",
                credentials.ssid, self.config.sta_connect_timeout_ms
            );
            false
        }
    }

    fn start_access_point_portal(&mut self) {
        info!("provisioning: starting fallback AP and captive portal");

        let settings = AccessPointSettings {
            ssid: self.config.ap_ssid.clone(),
            password: self.config.ap_password.clone(),
            ip: self.config.ap_ip,
            gateway: self.config.ap_gateway,
            netmask: self.config.ap_netmask,
        };

        let answer = match self.radio.start_access_point(&settings) {
            Ok(ip) => {
                info!("provisioning: AP `{}` started on {ip}", settings.ssid);
                ip
            }
            Err(err) => {
                warn!("provisioning: AP start failed: {err}");
                self.config.ap_ip
            }
        };

        match self.dns.start(self.config.dns_port, answer) {
            Ok(()) => {
                self.dns_running = true;
                info!(
                    "provisioning: captive dns on port {} answering {answer}",
                    self.config.dns_port
                );
            }
            Err(err) => warn!("provisioning: captive dns start failed: {err}"),
        }
    }

    fn start_http(&mut self) {
        match self.http.begin() {
            Ok(()) => info!("provisioning: http server started ({})", self.mode.as_str()),
            Err(err) => warn!("provisioning: http server start failed: {err}"),
        }
    }

    fn register_common_routes(&mut self) {
        self.router.route(
            HttpMethod::Get,
            "/wifi",
            Target::Portal(PortalRoute::WifiForm),
        );
        self.router.route(
            HttpMethod::Post,
            "/save",
            Target::Portal(PortalRoute::SaveCredentials),
        );
    }

    fn register_ap_routes(&mut self) {
        self.router
            .route(HttpMethod::Get, "/", Target::Portal(PortalRoute::Status));
        self.router
            .set_fallback(Target::Portal(PortalRoute::RedirectToWifi));
    }

    fn dispatch(&mut self, request: &HttpRequest) -> Handled {
        let route = match self.router.resolve(request.method, &request.path) {
            Some(Target::App(handler)) => return Handled::respond(handler(request)),
            Some(Target::Portal(route)) => *route,
            None => return Handled::respond(HttpResponse::text(404, "Not found")),
        };

        match route {
            PortalRoute::WifiForm => Handled::respond(self.handle_wifi_form()),
            PortalRoute::SaveCredentials => self.handle_save(request),
            PortalRoute::Status => Handled::respond(self.handle_status()),
            PortalRoute::RedirectToWifi => Handled::respond(HttpResponse::redirect("/wifi")),
        }
    }

    fn handle_wifi_form(&self) -> HttpResponse {
        HttpResponse::html(200, pages::wifi_form(self.saved_ssid().as_deref()))
    }

    fn handle_status(&self) -> HttpResponse {
        let ip = self
            .current_ip()
            .map(|ip| ip.to_string())
            .unwrap_or_default();
        HttpResponse::html(
            200,
            pages::portal_status(self.mode, &self.config.ap_ssid, &ip),
        )
    }

    fn handle_save(&mut self, request: &HttpRequest) -> Handled {
        let credentials = match validate_credentials(request) {
            Ok(credentials) => credentials,
            Err(message) => return Handled::respond(HttpResponse::text(400, message)),
        };

        let previous_ssid = self.store.get_str(&self.config.key_ssid).ok().flatten();

        if let Err(err) = self
            .store
            .put_str(&self.config.key_ssid, &credentials.ssid)
        {
            warn!("provisioning: failed to persist ssid: {err}");
            return Handled::respond(HttpResponse::text(500, "Failed to save credentials"));
        }

        if let Err(err) = self
            .store
            .put_str(&self.config.key_pass, &credentials.password)
        {
            warn!("provisioning: failed to persist password: {err}");
            self.restore_ssid(previous_ssid.as_deref());
            return Handled::respond(HttpResponse::text(500, "Failed to save credentials"));
        }

        info!("provisioning: saved credentials for `{}`", credentials.ssid);
        Handled {
            response: HttpResponse::html(200, pages::saved_page()),
            restart: true,
        }
    }

    /// Puts the stored SSID back so it never pairs with a password it was not saved with.
    fn restore_ssid(&mut self, previous: Option<&str>) {
        let restored = match previous {
            Some(ssid) => self.store.put_str(&self.config.key_ssid, ssid),
            None => self.store.remove(&self.config.key_ssid).map(|_| ()),
        };
        if let Err(err) = restored {
            warn!("provisioning: failed to restore previous ssid: {err}");
        }
    }
}

fn validate_credentials(request: &HttpRequest) -> Result<NetworkCredentials, &'static str> {
    let (Some(ssid), Some(pass)) = (request.field("ssid"), request.field("pass")) else {
        return Err("Missing SSID or pass");
    };

    let ssid = ssid.trim();
    if ssid.is_empty() {
        return Err("SSID empty");
    }

    if pass.chars().count() < MIN_PASSWORD_CHARS {
        return Err("pass must be at least 8 chars");
    }

    Ok(NetworkCredentials {
        ssid: ssid.to_string(),
        password: pass.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::{
        cell::Cell,
        collections::VecDeque,
        rc::Rc,
        sync::{Arc, Mutex},
    };

    use super::*;
    use crate::{
        error::NetError,
        error::StoreError,
        http::{IncomingRequest, RequestId},
        storage::{MemoryNamespace, MemoryStore},
    };
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct RadioLog {
        joins: Vec<(String, NetworkCredentials)>,
        access_points: Vec<AccessPointSettings>,
    }

    struct FakeRadio {
        joinable: Option<String>,
        start_fails: bool,
        connect_after_polls: u32,
        polls: u32,
        joined: bool,
        ap_ip: Option<Ipv4Addr>,
        log: Arc<Mutex<RadioLog>>,
    }

    impl WifiRadio for FakeRadio {
        fn begin_station(
            &mut self,
            hostname: &str,
            credentials: &NetworkCredentials,
        ) -> Result<(), NetError> {
            self.log
                .lock()
                .unwrap()
                .joins
                .push((hostname.to_string(), credentials.clone()));
            if self.start_fails {
                return Err(NetError::Driver("station start refused".to_string()));
            }
            self.joined = self.joinable.as_deref() == Some(credentials.ssid.as_str());
            Ok(())
        }

        fn is_connected(&mut self) -> bool {
            self.polls += 1;
            self.joined && self.polls > self.connect_after_polls
        }

        fn station_ip(&self) -> Option<Ipv4Addr> {
            self.joined.then_some(Ipv4Addr::new(192, 168, 1, 40))
        }

        fn start_access_point(
            &mut self,
            settings: &AccessPointSettings,
        ) -> Result<Ipv4Addr, NetError> {
            self.log.lock().unwrap().access_points.push(settings.clone());
            self.ap_ip = Some(settings.ip);
            Ok(settings.ip)
        }

        fn access_point_ip(&self) -> Option<Ipv4Addr> {
            self.ap_ip
        }
    }

    #[derive(Default)]
    struct HttpLog {
        started: bool,
        queue: VecDeque<IncomingRequest>,
        responses: Vec<(RequestId, HttpResponse)>,
        next_id: RequestId,
    }

    #[derive(Clone, Default)]
    struct FakeHttp(Arc<Mutex<HttpLog>>);

    impl FakeHttp {
        fn push(&self, request: HttpRequest) -> RequestId {
            let mut log = self.0.lock().unwrap();
            log.next_id += 1;
            let id = log.next_id;
            log.queue.push_back(IncomingRequest { id, request });
            id
        }

        fn response(&self, id: RequestId) -> HttpResponse {
            let log = self.0.lock().unwrap();
            log.responses
                .iter()
                .find(|(rid, _)| *rid == id)
                .map(|(_, response)| response.clone())
                .expect("request was answered")
        }
    }

    impl HttpServer for FakeHttp {
        fn begin(&mut self) -> Result<(), NetError> {
            self.0.lock().unwrap().started = true;
            Ok(())
        }

        fn next_request(&mut self) -> Option<IncomingRequest> {
            self.0.lock().unwrap().queue.pop_front()
        }

        fn respond(&mut self, id: RequestId, response: HttpResponse) {
            self.0.lock().unwrap().responses.push((id, response));
        }
    }

    #[derive(Default)]
    struct DnsLog {
        started: Option<(u16, Ipv4Addr)>,
        pending: u32,
        answered: u32,
    }

    #[derive(Clone, Default)]
    struct FakeDns(Arc<Mutex<DnsLog>>);

    impl CaptiveDns for FakeDns {
        fn start(&mut self, port: u16, answer: Ipv4Addr) -> Result<(), NetError> {
            self.0.lock().unwrap().started = Some((port, answer));
            Ok(())
        }

        fn process_next_request(&mut self) -> Result<bool, NetError> {
            let mut log = self.0.lock().unwrap();
            if log.started.is_none() {
                return Err(NetError::NotStarted("dns"));
            }
            if log.pending == 0 {
                return Ok(false);
            }
            log.pending -= 1;
            log.answered += 1;
            Ok(true)
        }
    }

    #[derive(Clone, Default)]
    struct FakeSystem {
        now: Rc<Cell<u64>>,
        sleeps: Rc<Cell<u64>>,
        restarts: Rc<Cell<u32>>,
    }

    impl System for FakeSystem {
        fn now_ms(&self) -> u64 {
            self.now.get()
        }

        fn sleep_ms(&self, ms: u64) {
            self.now.set(self.now.get() + ms);
            self.sleeps.set(self.sleeps.get() + ms);
        }

        fn restart(&self) {
            self.restarts.set(self.restarts.get() + 1);
        }
    }

    struct Rig {
        store: MemoryStore,
        radio_log: Arc<Mutex<RadioLog>>,
        http: FakeHttp,
        dns: FakeDns,
        system: FakeSystem,
        portal: ProvisioningController,
    }

    /// Fails every write to one key and passes everything else through.
    struct RejectingStore {
        inner: MemoryNamespace,
        rejected_key: &'static str,
    }

    impl RejectingStore {
        fn check(&self, key: &str) -> Result<(), StoreError> {
            if key == self.rejected_key {
                return Err(StoreError::Backend("flash write failed".to_string()));
            }
            Ok(())
        }
    }

    impl KeyValueStore for RejectingStore {
        fn namespace(&self) -> &str {
            self.inner.namespace()
        }

        fn get_u8(&self, key: &str) -> Result<Option<u8>, StoreError> {
            self.inner.get_u8(key)
        }

        fn get_bool(&self, key: &str) -> Result<Option<bool>, StoreError> {
            self.inner.get_bool(key)
        }

        fn get_str(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.inner.get_str(key)
        }

        fn put_u8(&mut self, key: &str, value: u8) -> Result<(), StoreError> {
            self.check(key)?;
            self.inner.put_u8(key, value)
        }

        fn put_bool(&mut self, key: &str, value: bool) -> Result<(), StoreError> {
            self.check(key)?;
            self.inner.put_bool(key, value)
        }

        fn put_str(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
            self.check(key)?;
            self.inner.put_str(key, value)
        }

        fn remove(&mut self, key: &str) -> Result<bool, StoreError> {
            self.check(key)?;
            self.inner.remove(key)
        }
    }

    #[derive(Default)]
    struct RigOptions {
        joinable: Option<&'static str>,
        connect_after_polls: u32,
        start_fails: bool,
        rejected_key: Option<&'static str>,
    }

    fn rig(joinable: Option<&'static str>, connect_after_polls: u32) -> Rig {
        rig_with(RigOptions {
            joinable,
            connect_after_polls,
            ..RigOptions::default()
        })
    }

    fn rig_with(options: RigOptions) -> Rig {
        let RigOptions {
            joinable,
            connect_after_polls,
            start_fails,
            rejected_key,
        } = options;
        let store = MemoryStore::new();
        let radio_log = Arc::new(Mutex::new(RadioLog::default()));
        let http = FakeHttp::default();
        let dns = FakeDns::default();
        let system = FakeSystem::default();

        let wifi_store: Box<dyn KeyValueStore> = match rejected_key {
            Some(rejected_key) => Box::new(RejectingStore {
                inner: store.open("wifi"),
                rejected_key,
            }),
            None => Box::new(store.open("wifi")),
        };

        let portal = ProvisioningController::new(
            ProvisioningConfig::default(),
            wifi_store,
            NetworkServices {
                radio: Box::new(FakeRadio {
                    joinable: joinable.map(str::to_string),
                    start_fails,
                    connect_after_polls,
                    polls: 0,
                    joined: false,
                    ap_ip: None,
                    log: radio_log.clone(),
                }),
                http: Box::new(http.clone()),
                dns: Box::new(dns.clone()),
            },
            Box::new(system.clone()),
        );

        Rig {
            store,
            radio_log,
            http,
            dns,
            system,
            portal,
        }
    }

    fn seed_credentials(store: &MemoryStore, ssid: &str, pass: &str) {
        let mut ns = store.open("wifi");
        ns.put_str("ssid", ssid).unwrap();
        ns.put_str("pass", pass).unwrap();
    }

    fn save_request(ssid: &str, pass: &str) -> HttpRequest {
        HttpRequest::new(HttpMethod::Post, "/save")
            .with_field("ssid", ssid)
            .with_field("pass", pass)
    }

    #[test]
    fn no_credentials_starts_captive_portal() {
        let mut rig = rig(None, 0);

        assert_eq!(rig.portal.begin(), ProvisioningMode::Ap);

        assert!(rig.radio_log.lock().unwrap().joins.is_empty());
        let ap = rig.radio_log.lock().unwrap().access_points[0].clone();
        assert_eq!(ap.ssid, "ESP32-SOLAR-SETUP");
        assert_eq!(ap.ip, Ipv4Addr::new(172, 16, 0, 1));
        assert_eq!(ap.netmask, Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(
            rig.dns.0.lock().unwrap().started,
            Some((53, Ipv4Addr::new(172, 16, 0, 1)))
        );
        assert!(rig.http.0.lock().unwrap().started);
        assert_eq!(rig.portal.access_point_ip(), Some(Ipv4Addr::new(172, 16, 0, 1)));
    }

    #[test]
    fn stored_credentials_join_station() {
        let mut rig = rig(Some("HomeNet"), 3);
        seed_credentials(&rig.store, "HomeNet", "secret-pass");

        assert_eq!(rig.portal.begin(), ProvisioningMode::Sta);

        let log = rig.radio_log.lock().unwrap();
        assert_eq!(log.joins.len(), 1);
        assert_eq!(log.joins[0].0, "esp32-solar");
        assert_eq!(log.joins[0].1.password, "secret-pass");
        assert!(log.access_points.is_empty());
        assert!(rig.dns.0.lock().unwrap().started.is_none());
        assert!(rig.http.0.lock().unwrap().started);
        assert_eq!(rig.system.sleeps.get(), 3 * 250);
        assert_eq!(rig.portal.station_ip(), Some(Ipv4Addr::new(192, 168, 1, 40)));
    }

    #[test]
    fn join_timeout_falls_back_and_keeps_credentials() {
        let mut rig = rig(None, 0);
        seed_credentials(&rig.store, "Elsewhere", "secret-pass");

        assert_eq!(rig.portal.begin(), ProvisioningMode::Ap);

        assert_eq!(rig.system.now.get(), 15_000);
        assert_eq!(
            rig.portal.saved_credentials(),
            Some(NetworkCredentials {
                ssid: "Elsewhere".to_string(),
                password: "secret-pass".to_string(),
            })
        );
        assert!(rig.dns.0.lock().unwrap().started.is_some());
    }

    #[test]
    fn station_start_error_falls_back_without_waiting() {
        let mut rig = rig_with(RigOptions {
            joinable: Some("HomeNet"),
            start_fails: true,
            ..RigOptions::default()
        });
        seed_credentials(&rig.store, "HomeNet", "secret-pass");

        assert_eq!(rig.portal.begin(), ProvisioningMode::Ap);

        assert_eq!(rig.radio_log.lock().unwrap().joins.len(), 1);
        assert_eq!(rig.radio_log.lock().unwrap().access_points.len(), 1);
        assert_eq!(rig.system.sleeps.get(), 0);
        assert!(rig.dns.0.lock().unwrap().started.is_some());
        assert_eq!(rig.portal.saved_ssid(), Some("HomeNet".to_string()));
    }

    #[test]
    fn ap_mode_serves_one_dns_query_per_tick() {
        let mut rig = rig(None, 0);
        rig.portal.begin();
        rig.dns.0.lock().unwrap().pending = 3;

        rig.portal.tick();
        assert_eq!(rig.dns.0.lock().unwrap().answered, 1);

        rig.portal.tick();
        rig.portal.tick();
        rig.portal.tick();
        assert_eq!(rig.dns.0.lock().unwrap().answered, 3);
    }

    #[test]
    fn sta_mode_never_touches_dns() {
        let mut rig = rig(Some("HomeNet"), 0);
        seed_credentials(&rig.store, "HomeNet", "secret-pass");
        rig.portal.begin();

        rig.portal.tick();

        assert_eq!(rig.dns.0.lock().unwrap().answered, 0);
    }

    #[test]
    fn wifi_form_shows_saved_ssid_only() {
        let mut rig = rig(None, 0);
        seed_credentials(&rig.store, "Elsewhere", "hunter2-secret");
        rig.portal.begin();

        let id = rig.http.push(HttpRequest::new(HttpMethod::Get, "/wifi"));
        rig.portal.tick();

        let response = rig.http.response(id);
        assert_eq!(response.status, 200);
        assert!(response.body.contains("Elsewhere"));
        assert!(!response.body.contains("hunter2-secret"));
    }

    #[test]
    fn short_password_is_rejected_without_side_effects() {
        let mut rig = rig(None, 0);
        rig.portal.begin();
        let writes = rig.store.write_count();

        let id = rig.http.push(save_request("MyNet", "short"));
        rig.portal.tick();

        let response = rig.http.response(id);
        assert_eq!(response.status, 400);
        assert_eq!(response.body, "pass must be at least 8 chars");
        assert_eq!(rig.store.write_count(), writes);
        assert_eq!(rig.system.restarts.get(), 0);
    }

    #[test]
    fn save_validation_messages() {
        let mut rig = rig(None, 0);
        rig.portal.begin();

        let cases = [
            (
                HttpRequest::new(HttpMethod::Post, "/save").with_field("ssid", "MyNet"),
                "Missing SSID or pass",
            ),
            (
                HttpRequest::new(HttpMethod::Post, "/save").with_field("pass", "longenough1"),
                "Missing SSID or pass",
            ),
            (save_request("   ", "longenough1"), "SSID empty"),
        ];

        for (request, expected) in cases {
            let id = rig.http.push(request);
            rig.portal.tick();
            let response = rig.http.response(id);
            assert_eq!(response.status, 400);
            assert_eq!(response.body, expected);
        }

        assert_eq!(rig.portal.saved_ssid(), None);
        assert_eq!(rig.system.restarts.get(), 0);
    }

    #[test]
    fn valid_save_persists_then_restarts() {
        let mut rig = rig(None, 0);
        rig.portal.begin();
        let before = rig.system.now.get();

        let id = rig.http.push(save_request("  MyNet ", "longenough1"));
        rig.portal.tick();

        let response = rig.http.response(id);
        assert_eq!(response.status, 200);
        assert!(response.body.contains("Saved"));
        assert_eq!(
            rig.portal.saved_credentials(),
            Some(NetworkCredentials {
                ssid: "MyNet".to_string(),
                password: "longenough1".to_string(),
            })
        );
        assert_eq!(rig.system.restarts.get(), 1);
        assert_eq!(rig.system.now.get() - before, 600);
    }

    #[test]
    fn raw_hex_psk_is_saved() {
        let mut rig = rig(None, 0);
        rig.portal.begin();
        let psk = "0123456789abcdef".repeat(4);

        let id = rig.http.push(save_request("MyNet", &psk));
        rig.portal.tick();

        assert_eq!(rig.http.response(id).status, 200);
        assert_eq!(
            rig.portal.saved_credentials(),
            Some(NetworkCredentials {
                ssid: "MyNet".to_string(),
                password: psk,
            })
        );
        assert_eq!(rig.system.restarts.get(), 1);
    }

    #[test]
    fn failed_password_write_restores_previous_ssid() {
        let mut rig = rig_with(RigOptions {
            rejected_key: Some("pass"),
            ..RigOptions::default()
        });
        seed_credentials(&rig.store, "OldNet", "old-secret");
        rig.portal.begin();

        let id = rig.http.push(save_request("NewNet", "new-secret"));
        rig.portal.tick();

        assert_eq!(rig.http.response(id).status, 500);
        assert_eq!(
            rig.portal.saved_credentials(),
            Some(NetworkCredentials {
                ssid: "OldNet".to_string(),
                password: "old-secret".to_string(),
            })
        );
        assert_eq!(rig.system.restarts.get(), 0);
    }

    #[test]
    fn failed_first_save_leaves_no_ssid_behind() {
        let mut rig = rig_with(RigOptions {
            rejected_key: Some("pass"),
            ..RigOptions::default()
        });
        rig.portal.begin();

        let id = rig.http.push(save_request("NewNet", "new-secret"));
        rig.portal.tick();

        assert_eq!(rig.http.response(id).status, 500);
        assert_eq!(rig.portal.saved_ssid(), None);
    }

    #[test]
    fn ap_mode_routes_status_and_redirects() {
        let mut rig = rig(None, 0);
        rig.portal.begin();

        let status = rig.http.push(HttpRequest::new(HttpMethod::Get, "/"));
        let probe = rig
            .http
            .push(HttpRequest::new(HttpMethod::Get, "/generate_204"));
        rig.portal.tick();

        let status = rig.http.response(status);
        assert_eq!(status.status, 200);
        assert!(status.body.contains("AP (setup)"));
        assert!(status.body.contains("172.16.0.1"));

        let probe = rig.http.response(probe);
        assert_eq!(probe.status, 302);
        assert_eq!(probe.header("Location"), Some("/wifi"));
    }

    #[test]
    fn sta_mode_has_no_catch_all() {
        let mut rig = rig(Some("HomeNet"), 0);
        seed_credentials(&rig.store, "HomeNet", "secret-pass");
        rig.portal.begin();

        let id = rig.http.push(HttpRequest::new(HttpMethod::Get, "/missing"));
        rig.portal.tick();

        assert_eq!(rig.http.response(id).status, 404);
    }

    #[test]
    fn app_routes_share_the_server() {
        let mut rig = rig(Some("HomeNet"), 0);
        seed_credentials(&rig.store, "HomeNet", "secret-pass");
        rig.portal.begin();
        rig.portal
            .router_mut()
            .get("/json", |_| HttpResponse::text(200, "{}"));

        let id = rig.http.push(HttpRequest::new(HttpMethod::Get, "/json"));
        rig.portal.tick();

        assert_eq!(rig.http.response(id).body, "{}");
    }

    #[test]
    fn factory_reset_clears_credentials() {
        let mut rig = rig(None, 0);
        seed_credentials(&rig.store, "HomeNet", "secret-pass");

        rig.portal.factory_reset_wifi();

        assert_eq!(rig.portal.saved_credentials(), None);
        assert_eq!(rig.store.value("wifi", "ssid"), None);
        assert_eq!(rig.store.value("wifi", "pass"), None);
        assert_eq!(rig.system.restarts.get(), 0);
    }
}
