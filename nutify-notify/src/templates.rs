//! HTML templates for email notifications.
//!
//! One template per event type plus a generic test template, all extending
//! a shared base layout. Selection is a closed map; unrecognized event
//! types fall back to the generic template.

use lazy_static::lazy_static;
use std::str::FromStr;
use tera::{Context, Tera};

use nutify_common::events::EventType;
use nutify_common::notification::EnrichedEvent;

use crate::error::ApiResult;

const BASE: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"></head>
<body style="font-family: Arial, sans-serif; margin: 0; padding: 16px; background: #f4f4f4;">
  <div style="max-width: 640px; margin: auto; background: #ffffff; border-radius: 6px; overflow: hidden;">
    <div style="padding: 16px 24px; background: {% block banner_color %}#34495e{% endblock banner_color %}; color: #ffffff;">
      <h2 style="margin: 0;">{% block headline %}UPS Event{% endblock headline %}</h2>
      <p style="margin: 4px 0 0 0; opacity: 0.85;">{{ server_name }} &middot; {{ event_date }} {{ event_time }}</p>
    </div>
    <div style="padding: 24px;">
      <p>{% block intro %}{{ event_message }}{% endblock intro %}</p>
      {% block durations %}{% endblock durations %}
      <table style="width: 100%; border-collapse: collapse; margin-top: 16px;">
        <tr><td colspan="2" style="padding: 6px 0; font-weight: bold; border-bottom: 1px solid #ddd;">Device</td></tr>
        {% if ups_model %}<tr><td style="padding: 4px 0; color: #777;">Model</td><td>{{ ups_model }}</td></tr>{% endif %}
        {% if ups_serial %}<tr><td style="padding: 4px 0; color: #777;">Serial</td><td>{{ ups_serial }}</td></tr>{% endif %}
        {% if ups_manufacturer %}<tr><td style="padding: 4px 0; color: #777;">Manufacturer</td><td>{{ ups_manufacturer }}</td></tr>{% endif %}
        {% if ups_firmware %}<tr><td style="padding: 4px 0; color: #777;">Firmware</td><td>{{ ups_firmware }}</td></tr>{% endif %}
        {% if ups_location %}<tr><td style="padding: 4px 0; color: #777;">Location</td><td>{{ ups_location }}</td></tr>{% endif %}
        <tr><td colspan="2" style="padding: 10px 0 6px 0; font-weight: bold; border-bottom: 1px solid #ddd;">Status</td></tr>
        {% if ups_status %}<tr><td style="padding: 4px 0; color: #777;">UPS status</td><td>{{ ups_status }}</td></tr>{% endif %}
        {% if battery_charge %}<tr><td style="padding: 4px 0; color: #777;">Battery charge</td><td>{{ battery_charge }}</td></tr>{% endif %}
        {% if runtime_minutes %}<tr><td style="padding: 4px 0; color: #777;">Estimated runtime</td><td>{{ runtime_minutes }} min</td></tr>{% endif %}
        {% if ups_load %}<tr><td style="padding: 4px 0; color: #777;">Load</td><td>{{ ups_load }}%</td></tr>{% endif %}
        {% if ups_realpower %}<tr><td style="padding: 4px 0; color: #777;">Power draw</td><td>{{ ups_realpower }} W</td></tr>{% endif %}
        {% if input_voltage %}<tr><td style="padding: 4px 0; color: #777;">Input voltage</td><td>{{ input_voltage }} V</td></tr>{% endif %}
        {% if output_voltage %}<tr><td style="padding: 4px 0; color: #777;">Output voltage</td><td>{{ output_voltage }} V</td></tr>{% endif %}
        {% if battery_voltage %}<tr><td style="padding: 4px 0; color: #777;">Battery voltage</td><td>{{ battery_voltage }} V</td></tr>{% endif %}
      </table>
    </div>
    <div style="padding: 12px 24px; background: #fafafa; color: #999; font-size: 12px;">
      {{ ups_name }} monitored by {{ server_name }}
    </div>
  </div>
</body>
</html>"#;

const ONLINE: &str = r#"{% extends "base.html" %}
{% block banner_color %}#27ae60{% endblock banner_color %}
{% block headline %}Power restored{% endblock headline %}
{% block intro %}UPS {{ ups_name }} is back on line power.{% endblock intro %}
{% block durations %}{% if battery_duration %}<p style="background: #eafaf1; padding: 8px 12px; border-radius: 4px;">Time on battery: <b>{{ battery_duration }}</b></p>{% endif %}{% endblock durations %}"#;

const ONBATT: &str = r#"{% extends "base.html" %}
{% block banner_color %}#e67e22{% endblock banner_color %}
{% block headline %}Power failure{% endblock headline %}
{% block intro %}UPS {{ ups_name }} is running on battery power. Connected equipment will shut down when the battery is exhausted.{% endblock intro %}"#;

const LOWBATT: &str = r#"{% extends "base.html" %}
{% block banner_color %}#c0392b{% endblock banner_color %}
{% block headline %}Battery low{% endblock headline %}
{% block intro %}UPS {{ ups_name }} battery is nearly exhausted. Shutdown is imminent.{% endblock intro %}"#;

const COMMBAD: &str = r#"{% extends "base.html" %}
{% block banner_color %}#c0392b{% endblock banner_color %}
{% block headline %}Communication lost{% endblock headline %}
{% block intro %}Communication with UPS {{ ups_name }} has been lost. Telemetry and shutdown protection are unavailable until it returns.{% endblock intro %}"#;

const COMMOK: &str = r#"{% extends "base.html" %}
{% block banner_color %}#27ae60{% endblock banner_color %}
{% block headline %}Communication restored{% endblock headline %}
{% block intro %}Communication with UPS {{ ups_name }} has been restored.{% endblock intro %}
{% block durations %}{% if comm_duration %}<p style="background: #eafaf1; padding: 8px 12px; border-radius: 4px;">Outage length: <b>{{ comm_duration }}</b></p>{% endif %}{% endblock durations %}"#;

const NOCOMM: &str = r#"{% extends "base.html" %}
{% block banner_color %}#c0392b{% endblock banner_color %}
{% block headline %}UPS unavailable{% endblock headline %}
{% block intro %}UPS {{ ups_name }} has been unavailable for an extended period.{% endblock intro %}"#;

const SHUTDOWN: &str = r#"{% extends "base.html" %}
{% block banner_color %}#8e44ad{% endblock banner_color %}
{% block headline %}System shutdown{% endblock headline %}
{% block intro %}The system is being shut down by UPS {{ ups_name }}.{% endblock intro %}"#;

const FSD: &str = r#"{% extends "base.html" %}
{% block banner_color %}#8e44ad{% endblock banner_color %}
{% block headline %}Forced shutdown{% endblock headline %}
{% block intro %}UPS {{ ups_name }} is executing a forced shutdown.{% endblock intro %}"#;

const REPLBATT: &str = r#"{% extends "base.html" %}
{% block banner_color %}#d35400{% endblock banner_color %}
{% block headline %}Replace battery{% endblock headline %}
{% block intro %}UPS {{ ups_name }} reports its battery needs replacing.{% endblock intro %}"#;

const NOPARENT: &str = r#"{% extends "base.html" %}
{% block banner_color %}#7f8c8d{% endblock banner_color %}
{% block headline %}Monitor process died{% endblock headline %}
{% block intro %}The upsmon parent process died; shutdown protection is impaired for UPS {{ ups_name }}.{% endblock intro %}"#;

const GENERIC: &str = r#"{% extends "base.html" %}
{% block headline %}UPS event: {{ event_type }}{% endblock headline %}"#;

const TEST: &str = r#"{% extends "base.html" %}
{% block banner_color %}#2980b9{% endblock banner_color %}
{% block headline %}Test notification{% endblock headline %}
{% block intro %}This is a test notification from {{ server_name }}. If you can read this, the channel is configured correctly.{% endblock intro %}"#;

lazy_static! {
    static ref TERA: Tera = {
        let mut tera = Tera::default();
        tera.add_raw_templates(vec![
            ("base.html", BASE),
            ("event_online.html", ONLINE),
            ("event_onbatt.html", ONBATT),
            ("event_lowbatt.html", LOWBATT),
            ("event_commbad.html", COMMBAD),
            ("event_commok.html", COMMOK),
            ("event_nocomm.html", NOCOMM),
            ("event_shutdown.html", SHUTDOWN),
            ("event_fsd.html", FSD),
            ("event_replbatt.html", REPLBATT),
            ("event_noparent.html", NOPARENT),
            ("event_generic.html", GENERIC),
            ("event_test.html", TEST),
        ])
        .expect("event templates must parse");
        tera
    };
}

/// The closed event-type to template map.
pub fn template_for(event_type: &str) -> &'static str {
    match EventType::from_str(event_type) {
        Ok(EventType::Online) => "event_online.html",
        Ok(EventType::Onbatt) => "event_onbatt.html",
        Ok(EventType::Lowbatt) => "event_lowbatt.html",
        Ok(EventType::Commbad) => "event_commbad.html",
        Ok(EventType::Commok) => "event_commok.html",
        Ok(EventType::Nocomm) => "event_nocomm.html",
        Ok(EventType::Shutdown) => "event_shutdown.html",
        Ok(EventType::Fsd) => "event_fsd.html",
        Ok(EventType::Replbatt) => "event_replbatt.html",
        Ok(EventType::Noparent) => "event_noparent.html",
        _ => "event_generic.html",
    }
}

/// Render the email body for an event (or the test template).
pub fn render_email(event: &EnrichedEvent, is_test: bool) -> ApiResult<String> {
    let template = if is_test {
        "event_test.html"
    } else {
        template_for(&event.event_type)
    };
    let mut context = Context::from_serialize(event)?;
    // Channels that reach rendering always have a display name.
    context.insert("server_name", event.server_name_or_default());
    context.insert("is_test", &is_test);
    Ok(TERA.render(template, &context)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> EnrichedEvent {
        EnrichedEvent {
            event_id: 1,
            ups_name: "ups@localhost".to_owned(),
            event_type: "ONBATT".to_owned(),
            event_message: "UPS ups@localhost on battery".to_owned(),
            server_name: Some("rack-4".to_owned()),
            ups_model: Some("Back-UPS 950".to_owned()),
            ups_status: Some("OB".to_owned()),
            battery_charge: Some("97%".to_owned()),
            runtime_minutes: Some(34),
            event_date: "2024-06-01".to_owned(),
            event_time: "12:00:02".to_owned(),
            ..Default::default()
        }
    }

    #[test]
    fn test_template_selection_is_closed() {
        assert_eq!(template_for("ONBATT"), "event_onbatt.html");
        assert_eq!(template_for("ONLINE"), "event_online.html");
        assert_eq!(template_for("CAL"), "event_generic.html");
        assert_eq!(template_for("VENDORWEIRD"), "event_generic.html");
    }

    #[test]
    fn test_render_onbatt() {
        let html = render_email(&sample_event(), false).unwrap();
        assert!(html.contains("Power failure"));
        assert!(html.contains("rack-4"));
        assert!(html.contains("Back-UPS 950"));
        assert!(html.contains("97%"));
    }

    #[test]
    fn test_render_online_includes_battery_duration() {
        let mut event = sample_event();
        event.event_type = "ONLINE".to_owned();
        event.battery_duration = Some("2 min".to_owned());
        let html = render_email(&event, false).unwrap();
        assert!(html.contains("Power restored"));
        assert!(html.contains("Time on battery: <b>2 min</b>"));
    }

    #[test]
    fn test_render_test_template() {
        let html = render_email(&sample_event(), true).unwrap();
        assert!(html.contains("Test notification"));
    }

    #[test]
    fn test_every_known_event_type_renders() {
        use nutify_common::events::EventType;
        use strum::IntoEnumIterator;

        for event_type in EventType::iter() {
            let mut event = sample_event();
            event.event_type = event_type.to_string();
            let html = render_email(&event, false)
                .unwrap_or_else(|e| panic!("render failed for {event_type}: {e}"));
            assert!(html.contains("rack-4"), "missing footer for {event_type}");
        }
    }

    #[test]
    fn test_render_escapes_html() {
        let mut event = sample_event();
        event.ups_model = Some("<script>alert(1)</script>".to_owned());
        let html = render_email(&event, false).unwrap();
        assert!(!html.contains("<script>alert(1)</script>"));
        assert!(html.contains("&lt;script&gt;"));
    }
}
