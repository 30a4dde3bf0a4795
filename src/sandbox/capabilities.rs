//! The fixed table of named capabilities bound into every sandbox execution.

use boa_engine::{Context, JsNativeError, JsResult, JsString, JsValue, NativeFunction};
use serde_json::Value;
use std::cell::RefCell;
use std::path::PathBuf;
use std::sync::Arc;

use super::toolkits;

/// Host implementation of one capability.
pub type HostFn = fn(&HostContext, &[Value]) -> Result<Value, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityGroup {
    Files,
    Archive,
    Data,
    Network,
    Vector,
    Geospatial,
    Graph,
    Image,
}

impl CapabilityGroup {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityGroup::Files => "files",
            CapabilityGroup::Archive => "archive",
            CapabilityGroup::Data => "data",
            CapabilityGroup::Network => "network",
            CapabilityGroup::Vector => "vector",
            CapabilityGroup::Geospatial => "geospatial",
            CapabilityGroup::Graph => "graph",
            CapabilityGroup::Image => "image",
        }
    }
}

#[derive(Clone, Copy)]
pub struct Capability {
    pub name: &'static str,
    pub group: CapabilityGroup,
    pub signature: &'static str,
    pub summary: &'static str,
    pub arity: usize,
    pub call: HostFn,
}

impl std::fmt::Debug for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capability")
            .field("name", &self.name)
            .field("group", &self.group)
            .finish()
    }
}

/// Shared handles the capabilities operate on.
#[derive(Debug, Clone)]
pub struct HostContext {
    pub http: reqwest::Client,
    /// Base for relative file paths. Always absolute.
    pub work_dir: PathBuf,
    /// Runtime used by the network capabilities. Without one they report an error.
    pub runtime: Option<tokio::runtime::Handle>,
}

impl HostContext {
    pub fn new(
        http: reqwest::Client,
        work_dir: PathBuf,
        runtime: Option<tokio::runtime::Handle>,
    ) -> Self {
        Self {
            http,
            work_dir: crate::page::absolute(work_dir),
            runtime,
        }
    }
}

/// Constructed once at startup and shared by reference with every execution.
#[derive(Debug)]
pub struct CapabilitySet {
    capabilities: Vec<Capability>,
    host: HostContext,
}

const STANDARD: &[Capability] = &[
    Capability {
        name: "readText",
        group: CapabilityGroup::Files,
        signature: "readText(path)",
        summary: "file contents as a string",
        arity: 1,
        call: toolkits::read_text,
    },
    Capability {
        name: "readJson",
        group: CapabilityGroup::Files,
        signature: "readJson(path)",
        summary: "parsed JSON file",
        arity: 1,
        call: toolkits::read_json,
    },
    Capability {
        name: "readBase64",
        group: CapabilityGroup::Files,
        signature: "readBase64(path)",
        summary: "file bytes as base64",
        arity: 1,
        call: toolkits::read_base64,
    },
    Capability {
        name: "listDir",
        group: CapabilityGroup::Files,
        signature: "listDir(path?)",
        summary: "sorted paths in a directory (default: working directory)",
        arity: 1,
        call: toolkits::list_dir,
    },
    Capability {
        name: "fileExists",
        group: CapabilityGroup::Files,
        signature: "fileExists(path)",
        summary: "true if the path exists",
        arity: 1,
        call: toolkits::file_exists,
    },
    Capability {
        name: "unzipList",
        group: CapabilityGroup::Archive,
        signature: "unzipList(path)",
        summary: "entry names of a zip archive",
        arity: 1,
        call: toolkits::unzip_list,
    },
    Capability {
        name: "unzipText",
        group: CapabilityGroup::Archive,
        signature: "unzipText(path, entry)",
        summary: "one zip entry as a string",
        arity: 2,
        call: toolkits::unzip_text,
    },
    Capability {
        name: "parseCsv",
        group: CapabilityGroup::Data,
        signature: "parseCsv(text, delimiter?)",
        summary: "rows as objects keyed by header, numbers typed",
        arity: 2,
        call: toolkits::parse_csv,
    },
    Capability {
        name: "fetchText",
        group: CapabilityGroup::Network,
        signature: "fetchText(url)",
        summary: "HTTP GET body as a string",
        arity: 1,
        call: toolkits::fetch_text,
    },
    Capability {
        name: "fetchJson",
        group: CapabilityGroup::Network,
        signature: "fetchJson(url)",
        summary: "HTTP GET body parsed as JSON",
        arity: 1,
        call: toolkits::fetch_json,
    },
    Capability {
        name: "sum",
        group: CapabilityGroup::Vector,
        signature: "sum(values)",
        summary: "sum of a numeric array",
        arity: 1,
        call: toolkits::sum,
    },
    Capability {
        name: "mean",
        group: CapabilityGroup::Vector,
        signature: "mean(values)",
        summary: "arithmetic mean",
        arity: 1,
        call: toolkits::mean,
    },
    Capability {
        name: "median",
        group: CapabilityGroup::Vector,
        signature: "median(values)",
        summary: "median",
        arity: 1,
        call: toolkits::median,
    },
    Capability {
        name: "stddev",
        group: CapabilityGroup::Vector,
        signature: "stddev(values)",
        summary: "population standard deviation",
        arity: 1,
        call: toolkits::stddev,
    },
    Capability {
        name: "dot",
        group: CapabilityGroup::Vector,
        signature: "dot(a, b)",
        summary: "dot product of equal-length arrays",
        arity: 2,
        call: toolkits::dot,
    },
    Capability {
        name: "cumsum",
        group: CapabilityGroup::Vector,
        signature: "cumsum(values)",
        summary: "running totals",
        arity: 1,
        call: toolkits::cumsum,
    },
    Capability {
        name: "haversineKm",
        group: CapabilityGroup::Geospatial,
        signature: "haversineKm(lat1, lon1, lat2, lon2)",
        summary: "great-circle distance in kilometres",
        arity: 4,
        call: toolkits::haversine_km,
    },
    Capability {
        name: "shortestPath",
        group: CapabilityGroup::Graph,
        signature: "shortestPath(edges, from, to)",
        summary: "{distance, path} over undirected [a, b, weight?] edges, or null",
        arity: 3,
        call: toolkits::shortest_path,
    },
    Capability {
        name: "connectedComponents",
        group: CapabilityGroup::Graph,
        signature: "connectedComponents(edges)",
        summary: "sorted node groups of an undirected graph",
        arity: 1,
        call: toolkits::connected_components,
    },
    Capability {
        name: "imageInfo",
        group: CapabilityGroup::Image,
        signature: "imageInfo(path)",
        summary: "{width, height, color}",
        arity: 1,
        call: toolkits::image_info,
    },
    Capability {
        name: "imagePixel",
        group: CapabilityGroup::Image,
        signature: "imagePixel(path, x, y)",
        summary: "[r, g, b, a] of one pixel",
        arity: 3,
        call: toolkits::image_pixel,
    },
];

impl CapabilitySet {
    /// The full standard table.
    pub fn standard(host: HostContext) -> Self {
        Self {
            capabilities: STANDARD.to_vec(),
            host,
        }
    }

    /// Standard table restricted to the given groups.
    pub fn with_groups(host: HostContext, groups: &[CapabilityGroup]) -> Self {
        Self {
            capabilities: STANDARD
                .iter()
                .filter(|c| groups.contains(&c.group))
                .copied()
                .collect(),
            host,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.capabilities.iter()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.capabilities.iter().map(|c| c.name).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.capabilities.iter().any(|c| c.name == name)
    }

    pub fn host(&self) -> &HostContext {
        &self.host
    }

    /// One line per capability, grouped, for prompts and `--help` style output.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        let mut current: Option<CapabilityGroup> = None;
        for cap in &self.capabilities {
            if current != Some(cap.group) {
                out.push_str(&format!("[{}]\n", cap.group.as_str()));
                current = Some(cap.group);
            }
            out.push_str(&format!("  {} - {}\n", cap.signature, cap.summary));
        }
        out
    }
}

thread_local! {
    static BOUND: RefCell<Option<Arc<CapabilitySet>>> = const { RefCell::new(None) };
}

/// Keeps a capability set bound to the executing thread until dropped.
pub(crate) struct Binding {
    previous: Option<Arc<CapabilitySet>>,
}

impl Binding {
    pub(crate) fn bind(set: &Arc<CapabilitySet>) -> Self {
        let previous = BOUND.with(|b| b.borrow_mut().replace(Arc::clone(set)));
        Self { previous }
    }
}

impl Drop for Binding {
    fn drop(&mut self) {
        let previous = self.previous.take();
        BOUND.with(|b| *b.borrow_mut() = previous);
    }
}

fn with_bound(call: HostFn, args: &[Value]) -> Result<Value, String> {
    let set = BOUND
        .with(|b| b.borrow().clone())
        .ok_or_else(|| "capability called outside an execution".to_string())?;
    call(&set.host, args)
}

/// Register every capability of `set` as a global function of `context`.
pub(crate) fn install(context: &mut Context, set: &CapabilitySet) -> JsResult<()> {
    for cap in &set.capabilities {
        let name = cap.name;
        let call = cap.call;
        let function = NativeFunction::from_copy_closure(move |_this, args, ctx| {
            invoke(name, call, args, ctx)
        });
        context.register_global_callable(JsString::from(name), cap.arity, function)?;
    }
    Ok(())
}

fn invoke(name: &'static str, call: HostFn, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let mut values = Vec::with_capacity(args.len());
    for arg in args {
        if arg.is_undefined() {
            values.push(Value::Null);
        } else {
            values.push(arg.to_json(ctx)?);
        }
    }
    match with_bound(call, &values) {
        Ok(value) => JsValue::from_json(&value, ctx),
        Err(message) => {
            let message = format!("{}: {}", name, message);
            Err(JsNativeError::typ().with_message(message).into())
        }
    }
}
