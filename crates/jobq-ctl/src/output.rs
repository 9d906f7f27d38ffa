use jobq_queue::QueueError;
use serde::Serialize;
use serde_json::Value;

/// Envelope printed for every command.
#[derive(Debug, Serialize)]
struct Response {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

pub(crate) fn success(data: Value) {
    print(&Response {
        status: "success",
        data: Some(data),
        code: None,
        message: None,
    });
}

pub(crate) fn error(err: &anyhow::Error) {
    print(&error_response(err));
}

fn error_response(err: &anyhow::Error) -> Response {
    let code = err
        .downcast_ref::<QueueError>()
        .map(QueueError::code)
        .unwrap_or("ERROR");
    Response {
        status: "error",
        data: None,
        code: Some(code),
        message: Some(format!("{err:#}")),
    }
}

fn print(response: &Response) {
    match serde_json::to_string_pretty(response) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("failed to encode response: {e}"),
    }
}
