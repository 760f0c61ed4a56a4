use drover::{ProcessStatus, ReloadSummary, Stream};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
	Status {
		#[serde(default)]
		names: Vec<String>,
	},
	Start {
		#[serde(default)]
		names: Vec<String>,
		#[serde(default)]
		all: bool,
	},
	Stop {
		#[serde(default)]
		names: Vec<String>,
		#[serde(default)]
		all: bool,
		#[serde(default)]
		timeout_secs: Option<f64>,
	},
	Restart {
		#[serde(default)]
		names: Vec<String>,
		#[serde(default)]
		all: bool,
	},
	Reload,
	Logs {
		name: String,
		#[serde(default = "default_stream")]
		stream: Stream,
		#[serde(default = "default_lines")]
		lines: usize,
	},
	Ping,
	Shutdown,
}

fn default_stream() -> Stream {
	Stream::Stdout
}

pub fn default_lines() -> usize {
	100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
	Ok { message: Option<String> },
	Status { processes: Vec<ProcessStatus>, http_port: Option<u16> },
	Reloaded { summary: ReloadSummary },
	Log { name: String, stream: Stream, text: String, fallback: bool },
	Error { message: String },
	Pong { pid: u32, version: String },
}

pub fn daemon_paths() -> gatepost::DaemonPaths {
	gatepost::DaemonPaths::new("corral")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn request_wire_shape() {
		let json = serde_json::to_string(&Request::Stop {
			names: vec!["web".into()],
			all: false,
			timeout_secs: Some(2.5),
		})
		.unwrap();
		assert_eq!(json, r#"{"cmd":"stop","names":["web"],"all":false,"timeout_secs":2.5}"#);
		assert_eq!(serde_json::to_string(&Request::Reload).unwrap(), r#"{"cmd":"reload"}"#);
	}

	#[test]
	fn optional_request_fields_default() {
		let req: Request = serde_json::from_str(r#"{"cmd":"logs","name":"web"}"#).unwrap();
		assert_eq!(
			req,
			Request::Logs {
				name: "web".into(),
				stream: Stream::Stdout,
				lines: 100,
			}
		);
		let req: Request = serde_json::from_str(r#"{"cmd":"start","all":true}"#).unwrap();
		assert_eq!(req, Request::Start { names: vec![], all: true });
		let req: Request = serde_json::from_str(r#"{"cmd":"status"}"#).unwrap();
		assert_eq!(req, Request::Status { names: vec![] });
	}

	#[test]
	fn unknown_command_is_rejected() {
		assert!(serde_json::from_str::<Request>(r#"{"cmd":"explode"}"#).is_err());
	}

	#[test]
	fn response_wire_shape() {
		let json = serde_json::to_string(&Response::Error { message: "nope".into() }).unwrap();
		assert_eq!(json, r#"{"type":"error","message":"nope"}"#);
		let resp: Response = serde_json::from_str(r#"{"type":"pong","pid":7,"version":"0.3.0"}"#).unwrap();
		assert!(matches!(resp, Response::Pong { pid: 7, .. }));
	}
}
