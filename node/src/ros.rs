use camera_upload_common::config::Config;
use camera_upload_common::frame::Frame;
use chrono::DateTime;
use r2r::sensor_msgs::msg::Image;
use r2r::ParameterValue;
use std::sync::PoisonError;
use std::time::Instant;
use tracing::{debug, warn};

pub const NODE_NAME: &str = "camera_uploader";

/// Turn a `sensor_msgs/Image` into a frame received at `received_at`.
pub fn frame_from_msg(msg: Image, received_at: Instant) -> Frame {
    let stamp = &msg.header.stamp;
    // Publishers that don't stamp their images leave the header at zero.
    let captured_at = if stamp.sec == 0 && stamp.nanosec == 0 {
        None
    } else {
        DateTime::from_timestamp(i64::from(stamp.sec), stamp.nanosec)
    };

    Frame {
        width: msg.width,
        height: msg.height,
        step: msg.step,
        encoding: msg.encoding,
        is_bigendian: msg.is_bigendian != 0,
        data: msg.data,
        stamp: captured_at,
        received_at,
    }
}

/// Parameters the node exposes, seeded from the loaded configuration.
fn declared_values(config: &Config) -> Vec<(&'static str, ParameterValue)> {
    vec![
        (
            "connection_string",
            ParameterValue::String(config.store.connection_string.clone()),
        ),
        (
            "container_name",
            ParameterValue::String(config.store.container_name.clone()),
        ),
        (
            "upload_interval",
            ParameterValue::Double(config.capture.upload_interval),
        ),
        (
            "jpeg_quality",
            ParameterValue::Integer(i64::from(config.capture.jpeg_quality)),
        ),
    ]
}

/// Declare the node's parameters so they show up in `ros2 param list`.
/// Values already given on the command line are left as they are.
pub fn declare_parameters(node: &r2r::Node, config: &Config) {
    let mut params = node.params.lock().unwrap_or_else(PoisonError::into_inner);
    for (name, value) in declared_values(config) {
        params
            .entry(name.to_string())
            .or_insert_with(|| r2r::Parameter::new(value));
    }
}

/// Overlay node parameters (`--ros-args -p name:=value`) onto `config`.
pub fn apply_parameters(node: &r2r::Node, config: &mut Config) {
    let params = node.params.lock().unwrap_or_else(PoisonError::into_inner);
    for (name, param) in params.iter() {
        apply_parameter(config, name, &param.value);
    }
}

fn apply_parameter(config: &mut Config, name: &str, value: &ParameterValue) {
    match (name, value) {
        ("connection_string" | "azure_connection_string", ParameterValue::String(s)) => {
            config.store.connection_string = s.clone();
        }
        ("container_name", ParameterValue::String(s)) => {
            config.store.container_name = s.clone();
        }
        ("upload_interval", ParameterValue::Double(v)) => {
            config.capture.upload_interval = *v;
        }
        ("upload_interval", ParameterValue::Integer(v)) => {
            config.capture.upload_interval = *v as f64;
        }
        ("jpeg_quality", ParameterValue::Integer(v)) => match u8::try_from(*v) {
            Ok(q) => config.capture.jpeg_quality = q,
            Err(_) => warn!(value = v, "jpeg_quality parameter out of range, ignoring"),
        },
        (
            "connection_string" | "azure_connection_string" | "container_name" | "upload_interval"
            | "jpeg_quality",
            other,
        ) => {
            warn!(parameter = name, value = ?other, "parameter has the wrong type, ignoring");
        }
        _ => {
            debug!(parameter = name, "ignoring unrelated parameter");
        }
    }
}
