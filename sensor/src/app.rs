use std::{cell::RefCell, rc::Rc};

use log::{info, warn};

use thermometer_common::{
    pages, BootAction, BootClassifier, HttpResponse, ProbeConfig, ProvisioningController,
    ProvisioningMode, System, TemperatureReport,
};

pub const POLL_INTERVAL_MS: u64 = 10;

pub trait TemperatureProbe {
    fn read_celsius(&mut self) -> Option<f32>;
}

pub type SharedProbe = Rc<RefCell<dyn TemperatureProbe>>;

pub struct Device {
    pub boot: BootClassifier,
    pub portal: ProvisioningController,
    pub probe: SharedProbe,
    pub probe_config: ProbeConfig,
    pub system: Box<dyn System>,
}

impl Device {
    /// Boot classification, factory-reset handling and provisioning. Returns
    /// the network mode this boot settled on.
    pub fn start(&mut self) -> ProvisioningMode {
        if self.boot.begin(self.system.now_ms()) == BootAction::FactoryReset {
            warn!("factory reset requested; wiping wifi credentials and restarting");
            self.portal.factory_reset_wifi();
            self.boot.reset_window();
            self.system.restart();
        }

        let mode = self.portal.begin();
        self.register_report_routes(mode);
        info!(
            "device ready in {} mode at {}",
            mode.as_str(),
            self.current_ip()
        );
        mode
    }

    pub fn poll(&mut self) {
        self.boot.tick(self.system.now_ms());
        self.portal.tick();
    }

    pub fn run(mut self, mut on_idle: impl FnMut()) -> ! {
        loop {
            self.poll();
            on_idle();
            self.system.sleep_ms(POLL_INTERVAL_MS);
        }
    }

    fn current_ip(&self) -> String {
        self.portal
            .current_ip()
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "0.0.0.0".to_string())
    }

    fn register_report_routes(&mut self, mode: ProvisioningMode) {
        let hostname = self.portal.hostname().to_string();
        let ip = self.current_ip();

        {
            let probe = self.probe.clone();
            let probe_config = self.probe_config.clone();
            let hostname = hostname.clone();
            let ip = ip.clone();
            self.portal.router_mut().get("/json", move |_| {
                let temp_c = probe_config.sanitize(probe.borrow_mut().read_celsius());
                HttpResponse::json(&TemperatureReport::new(&hostname, ip.clone(), temp_c))
            });
        }

        // In AP mode `/` stays the portal status page.
        if mode == ProvisioningMode::Sta {
            let probe = self.probe.clone();
            let probe_config = self.probe_config.clone();
            self.portal.router_mut().get("/", move |_| {
                let temp_c = probe_config.sanitize(probe.borrow_mut().read_celsius());
                HttpResponse::html(200, pages::temperature_page(&hostname, &ip, temp_c))
            });
        }
    }
}
