use std::fmt::Write as _;

use crate::types::{celsius_to_fahrenheit, ProvisioningMode};

const HEAD: &str = "<!doctype html><html><head><meta charset='utf-8'>\
<meta name='viewport' content='width=device-width,initial-scale=1'>";

const CARD_STYLE: &str = "<style>body{font-family:system-ui;margin:24px}\
.card{max-width:520px;padding:18px;border:1px solid #ddd;border-radius:14px}\
input{width:100%;padding:10px;margin:8px 0;border:1px solid #ccc;border-radius:10px;box-sizing:border-box}\
button{padding:10px 14px;border:0;border-radius:10px}\
a{display:inline-block;margin-top:10px}\
.big{font-size:42px;font-weight:700;margin:10px 0}.muted{color:#666}</style>";

pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

pub fn wifi_form(saved_ssid: Option<&str>) -> String {
    let mut page = String::with_capacity(1200);
    page.push_str(HEAD);
    page.push_str("<title>Configure Wi-Fi</title>");
    page.push_str(CARD_STYLE);
    page.push_str("</head><body><div class='card'><h3>Configure Wi-Fi</h3>");

    if let Some(ssid) = saved_ssid.filter(|ssid| !ssid.is_empty()) {
        let ssid = escape_html(ssid);
        let _ = write!(page, "<p>Saved SSID: <b>{ssid}</b></p>");
    }

    page.push_str(
        "<form method='POST' action='/save'>\
<label>SSID</label><input name='ssid' required>\
<label>Password</label><input name='pass' type='password' minlength='8' required>\
<button type='submit'>Save &amp; Reboot</button></form>\
<p class='muted'>After reboot, the device will try to join your Wi-Fi.</p>\
</div></body></html>",
    );
    page
}

pub fn portal_status(mode: ProvisioningMode, ap_ssid: &str, ip: &str) -> String {
    let mut page = String::with_capacity(800);
    page.push_str(HEAD);
    page.push_str("<title>Device Setup</title>");
    page.push_str(CARD_STYLE);
    page.push_str("</head><body><div class='card'><h3>Device Setup</h3>");

    match mode {
        ProvisioningMode::Ap => {
            let _ = write!(
                page,
                "<p><b>Mode:</b> AP (setup)</p><p><b>AP SSID:</b> {}</p>\
<p><b>AP IP:</b> {ip}</p><a href='/wifi'>Configure Wi-Fi</a>",
                escape_html(ap_ssid)
            );
        }
        ProvisioningMode::Sta => {
            let _ = write!(
                page,
                "<p><b>Mode:</b> STA</p><p><b>IP:</b> {ip}</p><a href='/wifi'>Change Wi-Fi</a>"
            );
        }
    }

    page.push_str("</div></body></html>");
    page
}

pub fn saved_page() -> String {
    "<html><body><p>Saved. Rebooting...</p></body></html>".to_string()
}

pub fn temperature_page(hostname: &str, ip: &str, temp_c: Option<f32>) -> String {
    let mut page = String::with_capacity(800);
    page.push_str(HEAD);
    page.push_str("<meta http-equiv='refresh' content='5'><title>Solar Temp</title>");
    page.push_str(CARD_STYLE);
    page.push_str("</head><body><div class='card'><div class='muted'>Wireless Thermometer</div>");

    match temp_c {
        Some(temp_c) => {
            let temp_f = celsius_to_fahrenheit(temp_c);
            let _ = write!(
                page,
                "<div class='big'>{temp_f:.2} &deg;F</div><div class='muted'>{temp_c:.2} &deg;C</div>"
            );
        }
        None => page.push_str("<div class='big'>Sensor error</div>"),
    }

    let hostname = escape_html(hostname);
    let _ = write!(
        page,
        "<hr><div class='muted'>IP: {ip}<br>Host: {hostname}</div></div></body></html>"
    );
    page
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn form_escapes_saved_ssid() {
        let page = wifi_form(Some("<script>x</script>"));

        assert!(page.contains("&lt;script&gt;x&lt;/script&gt;"));
        assert!(!page.contains("<script>"));
    }

    #[test]
    fn form_omits_empty_saved_ssid() {
        assert!(!wifi_form(Some("")).contains("Saved SSID"));
        assert!(!wifi_form(None).contains("Saved SSID"));
    }

    #[test]
    fn temperature_page_shows_both_scales() {
        let page = temperature_page("esp32-solar", "10.0.0.5", Some(100.0 / 9.0));

        assert!(page.contains("52.00 &deg;F"));
        assert!(page.contains("11.11 &deg;C"));
        assert!(temperature_page("h", "ip", None).contains("Sensor error"));
    }
}
