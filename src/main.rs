use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;

use log::error;
use parking_lot::Mutex;
use pyo3::prelude::*;

use python_was::error::BridgeError;
use python_was::http::{
    HttpRequest, HttpResponse, Method, RequestHandler, Responder, SharedResponder,
    StringInputStream, Uri,
};
use python_was::python::{add_sys_path, error_message};
use python_was::wsgi::{find_app, WsgiHandler};

struct CommandLine {
    sys_path: Vec<String>,
    module: Option<String>,
    app: Option<String>,
    // Accepted and parsed for forward compatibility; the WAS channel
    // does not need them.
    #[allow(dead_code)]
    host: Option<String>,
    #[allow(dead_code)]
    port: Option<u16>,
}

fn usage() {
    println!(
        "python-was [--host <ip>] [--port <port>] [--module <module>] [--app <app>] [--sys-path <path>]"
    );
}

fn get_arg<'a>(args: &'a [String], i: &mut usize) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(|arg| arg.as_str())
        .ok_or_else(|| "Missing parameter".to_string())
}

impl CommandLine {
    fn parse(args: &[String]) -> Result<CommandLine, String> {
        let mut cmdline = CommandLine {
            sys_path: Vec::new(),
            module: None,
            app: None,
            host: None,
            port: None,
        };
        let mut i = 0;
        while i < args.len() {
            match args[i].as_str() {
                "--module" => cmdline.module = Some(get_arg(args, &mut i)?.to_string()),
                "--app" => cmdline.app = Some(get_arg(args, &mut i)?.to_string()),
                "--host" => cmdline.host = Some(get_arg(args, &mut i)?.to_string()),
                "--port" => {
                    let raw = get_arg(args, &mut i)?;
                    cmdline.port =
                        Some(raw.parse().map_err(|_| "Could not parse port".to_string())?);
                }
                "--sys-path" => cmdline.sys_path.push(get_arg(args, &mut i)?.to_string()),
                other => return Err(format!("Unrecognized option '{other}'")),
            }
            i += 1;
        }
        Ok(cmdline)
    }
}

/// Prints status and headers to stderr and the body to stdout, mirroring
/// what the proxy would receive. Only used by the stdio test mode.
struct PrintResponder {
    headers_sent: bool,
}

impl Responder for PrintResponder {
    fn send_headers(&mut self, response: HttpResponse) -> Result<(), BridgeError> {
        eprintln!("STATUS {}", response.status);
        for (name, value) in &response.headers {
            eprintln!("{}: {}", name, String::from_utf8_lossy(value));
        }
        self.headers_sent = true;
        Ok(())
    }

    fn send_body(&mut self, data: &[u8]) -> Result<(), BridgeError> {
        std::io::stdout().write_all(data)?;
        Ok(())
    }

    fn headers_sent(&self) -> bool {
        self.headers_sent
    }
}

fn stdio_request(
    handler: &mut dyn RequestHandler,
    method: Method,
    uri: &str,
    content_type: &str,
    body: &str,
) {
    let mut request = HttpRequest {
        remote_addr: String::new(),
        script_name: String::new(),
        server_name: String::new(),
        server_port: String::new(),
        protocol: "HTTP/1.1".to_string(),
        scheme: "http".to_string(),
        method,
        uri: Uri::split(uri),
        headers: Vec::new(),
        body: None,
    };

    if !body.is_empty() {
        let content_length = body.len();
        request
            .headers
            .push(("Content-Type".to_string(), content_type.as_bytes().to_vec()));
        request.headers.push((
            "Content-Length".to_string(),
            content_length.to_string().into_bytes(),
        ));
        request.body = Some(Box::new(StringInputStream::new(body.as_bytes())));
    }

    let responder: SharedResponder = Arc::new(Mutex::new(PrintResponder {
        headers_sent: false,
    }));
    if let Err(err) = handler.process(request, responder) {
        error!("Exception handling request: {err}");
    }
    println!();
}

#[cfg(feature = "was-simple")]
fn run_was(handler: &mut WsgiHandler) -> Result<(), String> {
    log::info!("Starting in WAS mode");
    let transport = python_was::was_simple::WasSimple::new()
        .ok_or_else(|| "Could not set up the WAS channel".to_string())?;
    python_was::was::Was::new(transport).run(handler);
    Ok(())
}

#[cfg(not(feature = "was-simple"))]
fn run_was(_handler: &mut WsgiHandler) -> Result<(), String> {
    Err("Built without WAS support; rebuild with the 'was-simple' feature enabled".to_string())
}

fn run() -> Result<(), String> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cmdline = CommandLine::parse(&args).map_err(|message| {
        eprintln!("{message}");
        usage();
        "Could not parse command line arguments".to_string()
    })?;

    pyo3::prepare_freethreaded_python();

    let app = Python::with_gil(|py| -> Result<Py<PyAny>, String> {
        // Activating a virtualenv puts <venv>/bin on PATH; the
        // interpreter resolves pyvenv.cfg from there and picks up the
        // venv's site-packages on its own. "." makes an adjacent app.py
        // importable.
        add_sys_path(py, ".").map_err(|err| error_message(py, &err))?;
        for path in &cmdline.sys_path {
            add_sys_path(py, path).map_err(|err| error_message(py, &err))?;
        }

        find_app(py, cmdline.module.as_deref(), cmdline.app.as_deref())
            .map_err(|err| err.to_string())
    })?;

    let mut handler = WsgiHandler::new(app);

    // A terminal on stdin means a developer run, not the proxy; answer
    // two canned requests and exit.
    if unsafe { libc::isatty(0) } == 1 {
        stdio_request(&mut handler, Method::Get, "/", "", "");
        stdio_request(
            &mut handler,
            Method::Put,
            "/",
            "application/json",
            r#"{"key": "value"}"#,
        );
        return Ok(());
    }

    run_was(&mut handler)
}

fn main() -> ExitCode {
    env_logger::init();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("{message}");
            ExitCode::FAILURE
        }
    }
}
