use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::cookie::Jar;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RANGE, REFERER};
use reqwest::redirect::Policy;
use reqwest::{Certificate, Method, Proxy};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::RequestOptions;
use crate::error::{CoreError, CoreResult};
use crate::segment::ByteRange;
use crate::stall::{StallError, StallGuard, StallPolicy};

pub const MAX_REDIRECTS: usize = 10;
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const TRANSFER_TIMEOUT: Duration = Duration::from_secs(300);
/// Wire-level tracing is switched on from this log level upwards.
pub const VERBOSE_LOG_LEVEL: u8 = 4;
pub const WIRE_TARGET: &str = "segfetch::wire";

const READ_CHUNK: usize = 64 * 1024;

pub type HeaderMapping = HashMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefererPolicy {
    Fixed(String),
    /// Send the previous URL as referer when following redirects.
    Auto,
}

/// Fully resolved transfer policy for one request. Produced by [`configure`]
/// and applied when the client and request are built.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferConfig {
    pub headers: HeaderMapping,
    /// Empty means "no proxy", never "use the system proxy".
    pub proxy: String,
    pub referer: RefererPolicy,
    pub cookie_file: Option<PathBuf>,
    pub credentials: Option<(String, String)>,
    pub max_redirects: usize,
    pub connect_timeout: Duration,
    pub stall: StallPolicy,
    pub timeout: Duration,
    pub ca_bundle: Option<PathBuf>,
    pub verbose: bool,
}

/// Applies the transfer policy to `options`. Header overrides replace the
/// defaults wholesale; an empty override map counts as no override.
pub fn configure(options: &RequestOptions, header_overrides: Option<&HeaderMapping>) -> TransferConfig {
    let headers = match header_overrides {
        Some(overrides) if !overrides.is_empty() => overrides.clone(),
        _ => options.headers.clone(),
    };

    let referer = if options.referer_url.is_empty() {
        RefererPolicy::Auto
    } else {
        RefererPolicy::Fixed(options.referer_url.clone())
    };

    let credentials = if options.username.is_empty() && options.password.is_empty() {
        None
    } else {
        Some((options.username.clone(), options.password.clone()))
    };

    TransferConfig {
        headers,
        proxy: options.proxy.clone(),
        referer,
        cookie_file: options.cookie_file.clone(),
        credentials,
        max_redirects: MAX_REDIRECTS,
        connect_timeout: CONNECT_TIMEOUT,
        stall: StallPolicy::default(),
        timeout: TRANSFER_TIMEOUT,
        ca_bundle: options.ca_bundle.clone(),
        verbose: options.log_level >= VERBOSE_LOG_LEVEL,
    }
}

impl TransferConfig {
    /// Builds the blocking client. Cookie file and CA bundle are read here,
    /// so bad paths fail the transfer rather than [`configure`].
    pub fn build_client(&self) -> CoreResult<Client> {
        let mut builder = Client::builder()
            .redirect(Policy::limited(self.max_redirects))
            .connect_timeout(self.connect_timeout)
            .timeout(self.timeout)
            .referer(self.referer == RefererPolicy::Auto)
            .tls_built_in_root_certs(true)
            .connection_verbose(self.verbose);

        builder = if self.proxy.is_empty() {
            builder.no_proxy()
        } else {
            let proxy = Proxy::all(&self.proxy)
                .map_err(|err| CoreError::Config(format!("proxy {}: {}", self.proxy, err)))?;
            builder.proxy(proxy)
        };

        if let Some(path) = &self.cookie_file {
            builder = builder.cookie_provider(Arc::new(load_cookie_jar(path)?));
        }

        // Same roots back the proxy handshake, so HTTPS proxies are pinned too.
        if let Some(path) = &self.ca_bundle {
            for cert in load_ca_bundle(path)? {
                builder = builder.add_root_certificate(cert);
            }
        }

        builder
            .build()
            .map_err(|err| CoreError::Config(err.to_string()))
    }

    pub fn prepare(&self, client: &Client, method: Method, url: &str) -> CoreResult<RequestBuilder> {
        let mut request = client.request(method, url).headers(self.header_map()?);
        if let RefererPolicy::Fixed(referer) = &self.referer {
            request = request.header(REFERER, referer.as_str());
        }
        if let Some((user, pass)) = &self.credentials {
            request = request.basic_auth(user, Some(pass));
        }
        Ok(request)
    }

    fn header_map(&self) -> CoreResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        for (key, value) in &self.headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|err| CoreError::Config(format!("header {}: {}", key, err)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|err| CoreError::Config(format!("header {}: {}", key, err)))?;
            headers.insert(name, value);
        }
        Ok(headers)
    }
}

/// Blocking HTTP transport shared by the probe and segment workers.
#[derive(Clone)]
pub struct HttpTransport {
    options: RequestOptions,
    config: TransferConfig,
    client: Client,
}

impl HttpTransport {
    pub fn new(options: RequestOptions) -> CoreResult<Self> {
        let config = configure(&options, None);
        let client = config.build_client()?;
        Ok(Self {
            options,
            config,
            client,
        })
    }

    /// Replaces the low-speed abort policy used for body transfers.
    pub fn with_stall_policy(mut self, policy: StallPolicy) -> Self {
        self.config.stall = policy;
        self
    }

    pub fn options(&self) -> &RequestOptions {
        &self.options
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub(crate) fn send(
        &self,
        method: Method,
        url: &str,
        header_overrides: Option<&HeaderMapping>,
        range: Option<ByteRange>,
    ) -> CoreResult<Response> {
        self.dispatch(method, url, header_overrides, range)?
            .map_err(CoreError::from_transport)
    }

    /// Like `send`, but a failed exchange comes back as the raw transport
    /// error, which still carries the last URL the client reached.
    pub(crate) fn dispatch(
        &self,
        method: Method,
        url: &str,
        header_overrides: Option<&HeaderMapping>,
        range: Option<ByteRange>,
    ) -> CoreResult<Result<Response, reqwest::Error>> {
        let config = configure(&self.options, header_overrides);
        let mut request = config.prepare(&self.client, method.clone(), url)?;
        if let Some(range) = range {
            request = request.header(RANGE, range.header_value());
        }
        if config.verbose {
            debug!(target: WIRE_TARGET, "> {} {}", method, url);
            if let Some(range) = range {
                debug!(target: WIRE_TARGET, "> range: {}", range.header_value());
            }
        }
        let response = request.send();
        if config.verbose {
            match &response {
                Ok(response) => trace_response(response),
                Err(err) => debug!(target: WIRE_TARGET, "! {}", err),
            }
        }
        Ok(response)
    }

    /// Streams one segment (or the whole body when `range` is `None` or the
    /// sentinel) into `sink` and returns the number of bytes written. Raising
    /// `stop` ends the transfer with [`CoreError::Canceled`].
    pub fn fetch_range(
        &self,
        url: &str,
        range: Option<ByteRange>,
        sink: &mut dyn Write,
        stop: Option<&AtomicBool>,
    ) -> CoreResult<u64> {
        if is_stopped(stop) {
            return Err(CoreError::Canceled);
        }
        let range = range.filter(|range| !range.is_sentinel());
        let response = self.send(Method::GET, url, None, range)?;
        let status = response.status();
        if range.is_some() && status.as_u16() != 206 {
            return Err(CoreError::Network(format!(
                "range not supported (status {})",
                status.as_u16()
            )));
        }
        if !status.is_success() {
            return Err(CoreError::Network(format!(
                "download failed with status {}",
                status.as_u16()
            )));
        }
        copy_body(response, sink, self.config.stall, stop)
    }

    /// Fetches `url` into memory, saving it to `file` when given. Failures
    /// are logged and reported as `None`.
    pub fn download(&self, url: &str, file: Option<&Path>) -> Option<Vec<u8>> {
        if url.trim().is_empty() {
            warn!("download: url not valid: {:?}", url);
            return None;
        }
        info!("downloading {}", url);

        let mut buffer = Vec::new();
        if let Err(err) = self.fetch_range(url, None, &mut buffer, None) {
            warn!("download {}: {}", url, err);
            return None;
        }
        if let Some(path) = file {
            if let Err(err) = fs::write(path, &buffer) {
                warn!("download: cannot save {}: {}", path.display(), err);
                return None;
            }
        }
        Some(buffer)
    }
}

fn is_stopped(stop: Option<&AtomicBool>) -> bool {
    stop.map(|flag| flag.load(Ordering::SeqCst)).unwrap_or(false)
}

fn copy_body(
    response: Response,
    sink: &mut dyn Write,
    policy: StallPolicy,
    stop: Option<&AtomicBool>,
) -> CoreResult<u64> {
    let mut reader =
        StallGuard::spawn(response, policy).map_err(|err| CoreError::Io(err.to_string()))?;
    let mut buffer = vec![0u8; READ_CHUNK];
    let mut written = 0u64;
    loop {
        if is_stopped(stop) {
            return Err(CoreError::Canceled);
        }
        let read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if StallError::is_stall(&err) => {
                return Err(CoreError::Stalled(err.to_string()))
            }
            Err(err) if err.kind() == std::io::ErrorKind::TimedOut => {
                return Err(CoreError::Timeout(err.to_string()))
            }
            Err(err) => return Err(CoreError::Network(err.to_string())),
        };
        sink.write_all(&buffer[..read])
            .map_err(|err| CoreError::Io(err.to_string()))?;
        written += read as u64;
    }
    Ok(written)
}

fn trace_response(response: &Response) {
    debug!(target: WIRE_TARGET, "< {:?} {}", response.version(), response.status());
    for (name, value) in response.headers() {
        debug!(
            target: WIRE_TARGET,
            "< {}: {}",
            name,
            String::from_utf8_lossy(value.as_bytes())
        );
    }
}

fn load_cookie_jar(path: &Path) -> CoreResult<Jar> {
    let text = fs::read_to_string(path)
        .map_err(|err| CoreError::Config(format!("cookie file {}: {}", path.display(), err)))?;
    let jar = Jar::default();
    for (cookie, url) in parse_cookie_file(&text) {
        jar.add_cookie_str(&cookie, &url);
    }
    Ok(jar)
}

/// Reads a Netscape cookie-jar file into `(set-cookie string, origin url)`
/// pairs. Comment and malformed lines are skipped.
pub(crate) fn parse_cookie_file(text: &str) -> Vec<(String, Url)> {
    let mut cookies = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        let line = line.strip_prefix("#HttpOnly_").unwrap_or(line);
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != 7 {
            continue;
        }
        let (domain, path, secure, name, value) =
            (fields[0], fields[2], fields[3], fields[5], fields[6]);
        let host = domain.trim_start_matches('.');
        let secure = secure.eq_ignore_ascii_case("TRUE");
        let scheme = if secure { "https" } else { "http" };
        let Ok(url) = Url::parse(&format!("{}://{}{}", scheme, host, path)) else {
            continue;
        };
        let mut cookie = format!("{}={}; Domain={}; Path={}", name, value, domain, path);
        if secure {
            cookie.push_str("; Secure");
        }
        cookies.push((cookie, url));
    }
    cookies
}

fn load_ca_bundle(path: &Path) -> CoreResult<Vec<Certificate>> {
    let pem = fs::read(path)
        .map_err(|err| CoreError::Config(format!("ca bundle {}: {}", path.display(), err)))?;
    Certificate::from_pem_bundle(&pem)
        .map_err(|err| CoreError::Config(format!("ca bundle {}: {}", path.display(), err)))
}
