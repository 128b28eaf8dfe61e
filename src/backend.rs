use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info, warn};

use crate::config::SearchSettings;
use crate::error::SearchError;
use crate::filters::FilterSpec;
use crate::types::{join_expression, split_path, BackendRequest, RawMatch, ResultPage};

/// Synchronous adapter to the external index. Calls may block on I/O and
/// cannot be interrupted once dispatched.
pub trait SearchBackend: Send + Sync {
    fn query(&self, request: &BackendRequest) -> Result<ResultPage, SearchError>;
}

/// Everything version triple
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct EverythingVersion {
    pub major: u32,
    pub minor: u32,
    pub revision: u32,
}

impl EverythingVersion {
    const MINIMUM: Self = Self {
        major: 1,
        minor: 4,
        revision: 1,
    };

    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = text.trim().split('.').map(|p| p.trim().parse::<u32>());
        let major = parts.next()?.ok()?;
        let minor = parts.next()?.ok()?;
        let revision = parts.next().and_then(|r| r.ok()).unwrap_or(0);
        Some(Self {
            major,
            minor,
            revision,
        })
    }

    pub fn is_supported(&self) -> bool {
        *self >= Self::MINIMUM
    }
}

/// Everything backend driven through the es.exe command line client.
pub struct EsBackend {
    es_path: PathBuf,
    everything_path: Option<PathBuf>,
    instance: String,
}

impl EsBackend {
    pub fn new(es_path: PathBuf, everything_path: Option<PathBuf>, instance: String) -> Self {
        Self {
            es_path,
            everything_path,
            instance,
        }
    }

    /// Finds es.exe: configured path, next to the executable (`lib\` first),
    /// then under the working directory.
    pub fn locate(settings: &SearchSettings) -> Result<Self, SearchError> {
        let mut candidates = Vec::new();
        if let Some(p) = &settings.es_path {
            candidates.push(p.clone());
        }
        if let Some(exe_dir) = std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(Path::to_path_buf))
        {
            candidates.push(exe_dir.join("lib").join("es.exe"));
            candidates.push(exe_dir.join("es.exe"));
        }
        if let Ok(cwd) = std::env::current_dir() {
            candidates.push(cwd.join("lib").join("es.exe"));
        }

        let es_path = candidates
            .into_iter()
            .find(|p| p.exists())
            .ok_or_else(|| SearchError::BackendUnavailable("es.exe not found".to_string()))?;

        let everything_path = settings.everything_path.clone().or_else(|| {
            let sibling = es_path.with_file_name("Everything.exe");
            sibling.exists().then_some(sibling)
        });

        info!("using es.exe at {}", es_path.display());
        Ok(Self::new(es_path, everything_path, settings.es_instance.clone()))
    }

    fn base_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if !self.instance.is_empty() {
            args.push("-instance".to_string());
            args.push(self.instance.clone());
        }
        args
    }

    /// Arguments selecting the rows of `request`, without paging or output options.
    fn search_args(&self, request: &BackendRequest) -> Vec<String> {
        let mut args = self.base_args();
        let flags = &request.flags;
        if flags.match_case {
            args.push("-case".to_string());
        }
        if flags.match_whole_word {
            args.push("-whole-word".to_string());
        }
        if flags.match_path {
            args.push("-match-path".to_string());
        }
        args.push("-sort".to_string());
        args.push(flags.sort.es_argument());

        if flags.use_regex {
            args.push("-regex".to_string());
            args.push(request.expression.clone());
        } else {
            // One argument per token, otherwise es.exe treats the whole
            // expression as a single quoted phrase.
            match shell_words::split(&request.expression) {
                Ok(parts) => args.extend(parts),
                Err(_) => args.extend(request.expression.split_whitespace().map(str::to_string)),
            }
        }
        args
    }

    fn page_args(&self, request: &BackendRequest) -> Vec<String> {
        let mut args = vec![
            "-offset".to_string(),
            request.offset.to_string(),
            "-max-results".to_string(),
            request.limit.to_string(),
            "-tsv".to_string(),
            "-no-header".to_string(),
            "-full-path-and-name".to_string(),
            "-attributes".to_string(),
        ];
        args.extend(self.search_args(request));
        args
    }

    fn count_args(&self, request: &BackendRequest) -> Vec<String> {
        let mut args = vec!["-get-result-count".to_string()];
        args.extend(self.search_args(request));
        args
    }

    fn run(&self, args: &[String]) -> Result<String, SearchError> {
        run_es_silent(&self.es_path, args)
    }

    /// Version reported by the running Everything instance.
    pub fn version(&self) -> Result<EverythingVersion, SearchError> {
        let mut args = self.base_args();
        args.push("-get-everything-version".to_string());
        let out = self.run(&args)?;
        EverythingVersion::parse(&out)
            .filter(|v| v.major > 0 || v.minor > 0)
            .ok_or_else(|| {
                SearchError::BackendUnavailable(format!("unexpected version '{}'", out.trim()))
            })
    }

    fn ipc_ready(&self) -> bool {
        self.version().is_ok()
    }

    /// Starts Everything when its IPC does not answer and waits up to 3 s for it.
    pub fn ensure_running(&self) -> Result<EverythingVersion, SearchError> {
        if let Ok(version) = self.version() {
            debug!("Everything IPC ready (instance '{}')", self.instance);
            if !version.is_supported() {
                warn!(
                    "Everything {}.{}.{} is older than 1.4.1; results may be incomplete",
                    version.major, version.minor, version.revision
                );
            }
            return Ok(version);
        }

        let exe = self.everything_path.as_ref().ok_or_else(|| {
            SearchError::BackendUnavailable(
                "Everything is not running and Everything.exe was not found".to_string(),
            )
        })?;

        info!("Everything IPC not responding, starting {}", exe.display());
        let mut cmd = Command::new(exe);
        if !self.instance.is_empty() {
            cmd.arg("-instance").arg(&self.instance);
        }
        cmd.arg("-startup").arg("-first-instance");
        hide_console(&mut cmd);
        cmd.spawn().map_err(|e| {
            SearchError::BackendUnavailable(format!("cannot start Everything: {}", e))
        })?;

        for i in 0..15 {
            std::thread::sleep(std::time::Duration::from_millis(200));
            if self.ipc_ready() {
                info!("Everything IPC ready after {}ms", (i + 1) * 200);
                return self.version();
            }
        }

        Err(SearchError::BackendUnavailable(
            "Everything start timed out or IPC unreachable".to_string(),
        ))
    }
}

impl SearchBackend for EsBackend {
    /// Regex terms go to es.exe untouched; Everything's PCRE engine judges
    /// them and a refusal comes back as [`SearchError::QueryRejected`].
    fn query(&self, request: &BackendRequest) -> Result<ResultPage, SearchError> {
        let stdout = self.run(&self.page_args(request))?;
        let entries = parse_es_output(&stdout, &request.term, request.flags.use_regex);

        let total_available = match self.run(&self.count_args(request)) {
            Ok(out) => out.trim().parse::<u32>().ok(),
            Err(e) => {
                debug!("result count unavailable: {}", e);
                None
            }
        }
        .unwrap_or_else(|| {
            if entries.len() as u32 >= request.limit {
                u32::MAX
            } else {
                request.offset + entries.len() as u32
            }
        });

        debug!(
            "es query '{}' offset {} -> {} rows of {}",
            request.expression,
            request.offset,
            entries.len(),
            total_available
        );
        Ok(ResultPage {
            entries,
            total_available,
        })
    }
}

/// Maps an es.exe error level to the error taxonomy.
pub fn error_from_exit_code(code: i32, stderr: &str) -> SearchError {
    let detail = if stderr.trim().is_empty() {
        format!("es.exe exited with {}", code)
    } else {
        format!("es.exe exited with {}: {}", code, stderr.trim())
    };
    match code {
        // expected additional option / unknown switch
        4 | 6 => SearchError::QueryRejected(detail),
        _ => SearchError::BackendUnavailable(detail),
    }
}

fn parse_es_output(stdout: &str, term: &str, use_regex: bool) -> Vec<RawMatch> {
    let mut lines = stdout.lines();
    let mut results = Vec::new();

    // Older es.exe builds print a header even with -no-header
    if let Some(first) = lines.next() {
        if !first.starts_with("Filename") {
            push_tsv_line(first, term, use_regex, &mut results);
        }
    }
    for line in lines {
        push_tsv_line(line, term, use_regex, &mut results);
    }
    results
}

fn push_tsv_line(line: &str, term: &str, use_regex: bool, results: &mut Vec<RawMatch>) {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return;
    }

    let mut parts = line.split('\t');
    let path = parts.next().unwrap_or_default().trim_matches('"');
    if path.is_empty() {
        return;
    }
    let is_dir = match parts.next() {
        Some(attributes) => attributes.contains('D'),
        None => path.ends_with('\\') || path.ends_with('/'),
    };

    let path = path.trim_end_matches(['\\', '/']).to_string();
    let (parent, name) = split_path(&path);
    let (highlighted_name, highlighted_path) = if use_regex {
        (escape_markup(name), escape_markup(parent))
    } else {
        (highlight(name, term), highlight(parent, term))
    };

    results.push(RawMatch {
        highlighted_name,
        highlighted_path,
        is_dir,
        path,
    });
}

fn escape_markup(text: &str) -> String {
    text.replace('*', "**")
}

/// Everything highlight markup: `*` toggles highlighting, `**` is a literal
/// asterisk. Every case-insensitive occurrence of a term token is marked.
pub fn highlight(text: &str, term: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut marked = vec![false; chars.len()];

    for token in term.split_whitespace() {
        // operators and function tokens such as ext:pdf match nothing literally
        if token.contains(':') || token.starts_with('!') || token == "|" {
            continue;
        }
        let needle: Vec<char> = token
            .trim_matches('"')
            .chars()
            .filter(|c| *c != '*' && *c != '?')
            .collect();
        if needle.is_empty() || needle.len() > chars.len() {
            continue;
        }
        for start in 0..=(chars.len() - needle.len()) {
            let hit = needle
                .iter()
                .zip(&chars[start..])
                .all(|(a, b)| a.to_lowercase().eq(b.to_lowercase()));
            if hit {
                marked[start..start + needle.len()].iter_mut().for_each(|m| *m = true);
            }
        }
    }

    let mut out = String::with_capacity(text.len() + 4);
    let mut on = false;
    for (c, m) in chars.iter().zip(&marked) {
        if *m != on {
            out.push('*');
            on = *m;
        }
        if *c == '*' {
            out.push_str("**");
        } else {
            out.push(*c);
        }
    }
    if on {
        out.push('*');
    }
    out
}

/// Argument string that reopens the current search in Everything's own window.
pub fn open_in_everything_args(
    settings: &SearchSettings,
    filter: &FilterSpec,
    term: &str,
    selected: Option<&str>,
) -> String {
    let flags = filter.flags(settings);
    let sort = flags.sort;
    let mut args = format!("-sort \"{}\"", sort.field.label());
    args.push_str(if sort.ascending {
        " -sort-ascending"
    } else {
        " -sort-descending"
    });
    if let Some(path) = selected.filter(|p| !p.is_empty()) {
        args.push_str(&format!(" -select \"{}\"", path));
    }
    args.push_str(if flags.match_case { " -case" } else { " -nocase" });
    args.push_str(if flags.match_path {
        " -matchpath"
    } else {
        " -nomatchpath"
    });
    args.push_str(if flags.match_whole_word { " -ww" } else { " -noww" });
    args.push_str(if flags.use_regex { " -regex" } else { " -noregex" });
    let search = join_expression(&filter.search_prefix, term).replace('"', "\"\"");
    args.push_str(&format!(" -s \"{}\"", search));
    args
}

/// Full command line for [`open_in_everything_args`].
pub fn open_in_everything_command(
    everything_path: &Path,
    settings: &SearchSettings,
    filter: &FilterSpec,
    term: &str,
    selected: Option<&str>,
) -> String {
    format!(
        "\"{}\" {}",
        everything_path.display(),
        open_in_everything_args(settings, filter, term, selected)
    )
}

fn hide_console(cmd: &mut Command) {
    #[cfg(target_os = "windows")]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }
    #[cfg(not(target_os = "windows"))]
    let _ = cmd;
}

fn run_es_silent(es_path: &Path, args: &[String]) -> Result<String, SearchError> {
    let mut cmd = Command::new(es_path);
    cmd.args(args);
    hide_console(&mut cmd);

    let output = cmd
        .output()
        .map_err(|e| SearchError::BackendUnavailable(format!("cannot run es.exe: {}", e)))?;

    let stdout = decode_console(&output.stdout);
    if !output.status.success() {
        let stderr = decode_console(&output.stderr);
        return Err(error_from_exit_code(output.status.code().unwrap_or(-1), &stderr));
    }
    Ok(stdout)
}

/// es.exe writes UTF-8 on recent builds and the ANSI code page on older ones.
fn decode_console(bytes: &[u8]) -> String {
    let (utf8, _, had_errors) = encoding_rs::UTF_8.decode(bytes);
    if !had_errors {
        return utf8.into_owned();
    }
    let (gbk, _, _) = encoding_rs::GBK.decode(bytes);
    gbk.into_owned()
}
