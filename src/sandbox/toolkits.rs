//! Host-side implementations of the capabilities bound into the sandbox.
//!
//! Every function takes the already-converted JSON arguments and returns a JSON
//! value or a message. Messages become JavaScript exceptions inside the fragment.

use base64::Engine;
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};
use std::cmp::Reverse;
use std::io::Read;
use std::path::PathBuf;

use super::capabilities::HostContext;

pub type HostResult = Result<Value, String>;

// ── argument helpers ──────────────────────────────────────────────────

fn arg<'a>(args: &'a [Value], index: usize, name: &str) -> Result<&'a Value, String> {
    match args.get(index) {
        Some(Value::Null) | None => Err(format!("missing argument '{}'", name)),
        Some(v) => Ok(v),
    }
}

fn arg_str<'a>(args: &'a [Value], index: usize, name: &str) -> Result<&'a str, String> {
    arg(args, index, name)?
        .as_str()
        .ok_or_else(|| format!("argument '{}' must be a string", name))
}

fn arg_f64(args: &[Value], index: usize, name: &str) -> Result<f64, String> {
    arg(args, index, name)?
        .as_f64()
        .ok_or_else(|| format!("argument '{}' must be a number", name))
}

fn arg_numbers(args: &[Value], index: usize, name: &str) -> Result<Vec<f64>, String> {
    let items = arg(args, index, name)?
        .as_array()
        .ok_or_else(|| format!("argument '{}' must be an array of numbers", name))?;
    items
        .iter()
        .map(|v| match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        })
        .collect::<Option<Vec<f64>>>()
        .ok_or_else(|| format!("argument '{}' contains a non-numeric value", name))
}

fn number(value: f64) -> HostResult {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .ok_or_else(|| "result is not a finite number".to_string())
}

fn resolve(host: &HostContext, path: &str) -> PathBuf {
    let candidate = PathBuf::from(path);
    if candidate.is_absolute() {
        candidate
    } else {
        host.work_dir.join(candidate)
    }
}

fn read_bytes(host: &HostContext, path: &str) -> Result<Vec<u8>, String> {
    let resolved = resolve(host, path);
    std::fs::read(&resolved).map_err(|e| format!("cannot read {}: {}", resolved.display(), e))
}

// ── files ─────────────────────────────────────────────────────────────

pub fn read_text(host: &HostContext, args: &[Value]) -> HostResult {
    let bytes = read_bytes(host, arg_str(args, 0, "path")?)?;
    Ok(Value::String(String::from_utf8_lossy(&bytes).into_owned()))
}

pub fn read_json(host: &HostContext, args: &[Value]) -> HostResult {
    let bytes = read_bytes(host, arg_str(args, 0, "path")?)?;
    serde_json::from_slice(&bytes).map_err(|e| format!("invalid JSON: {}", e))
}

pub fn read_base64(host: &HostContext, args: &[Value]) -> HostResult {
    let bytes = read_bytes(host, arg_str(args, 0, "path")?)?;
    Ok(Value::String(
        base64::engine::general_purpose::STANDARD.encode(bytes),
    ))
}

pub fn list_dir(host: &HostContext, args: &[Value]) -> HostResult {
    let dir = match args.first().and_then(Value::as_str) {
        Some(path) => resolve(host, path),
        None => host.work_dir.clone(),
    };
    let mut names: Vec<String> = std::fs::read_dir(&dir)
        .map_err(|e| format!("cannot list {}: {}", dir.display(), e))?
        .filter_map(|e| e.ok())
        .map(|e| e.path().display().to_string())
        .collect();
    names.sort();
    Ok(json!(names))
}

pub fn file_exists(host: &HostContext, args: &[Value]) -> HostResult {
    Ok(Value::Bool(resolve(host, arg_str(args, 0, "path")?).exists()))
}

// ── archive ───────────────────────────────────────────────────────────

fn open_zip(host: &HostContext, path: &str) -> Result<zip::ZipArchive<std::fs::File>, String> {
    let resolved = resolve(host, path);
    let file = std::fs::File::open(&resolved)
        .map_err(|e| format!("cannot open {}: {}", resolved.display(), e))?;
    zip::ZipArchive::new(file).map_err(|e| format!("not a zip archive: {}", e))
}

pub fn unzip_list(host: &HostContext, args: &[Value]) -> HostResult {
    let archive = open_zip(host, arg_str(args, 0, "path")?)?;
    let names: Vec<&str> = archive.file_names().collect();
    let mut names: Vec<String> = names.into_iter().map(str::to_string).collect();
    names.sort();
    Ok(json!(names))
}

pub fn unzip_text(host: &HostContext, args: &[Value]) -> HostResult {
    let mut archive = open_zip(host, arg_str(args, 0, "path")?)?;
    let entry = arg_str(args, 1, "entry")?;
    let mut file = archive
        .by_name(entry)
        .map_err(|e| format!("entry '{}' not readable: {}", entry, e))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)
        .map_err(|e| format!("entry '{}' not readable: {}", entry, e))?;
    Ok(Value::String(String::from_utf8_lossy(&bytes).into_owned()))
}

// ── data ──────────────────────────────────────────────────────────────

/// Rows as objects keyed by the header row; numeric cells become numbers.
pub fn parse_csv(_host: &HostContext, args: &[Value]) -> HostResult {
    let text = arg_str(args, 0, "text")?;
    let delimiter = match args.get(1).and_then(Value::as_str) {
        Some(d) if d.len() == 1 => d.as_bytes()[0],
        Some(_) => return Err("delimiter must be a single character".to_string()),
        None => b',',
    };
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());
    let headers = reader
        .headers()
        .map_err(|e| format!("invalid CSV header: {}", e))?
        .clone();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| format!("invalid CSV row: {}", e))?;
        let mut row = Map::new();
        for (key, cell) in headers.iter().zip(record.iter()) {
            row.insert(key.to_string(), csv_cell(cell));
        }
        rows.push(Value::Object(row));
    }
    Ok(Value::Array(rows))
}

fn csv_cell(cell: &str) -> Value {
    if let Ok(i) = cell.parse::<i64>() {
        return json!(i);
    }
    match cell.parse::<f64>() {
        Ok(f) if f.is_finite() => json!(f),
        _ => Value::String(cell.to_string()),
    }
}

// ── network ───────────────────────────────────────────────────────────

fn fetch_body(host: &HostContext, url: &str) -> Result<String, String> {
    let runtime = host
        .runtime
        .as_ref()
        .ok_or_else(|| "network capabilities need an async runtime".to_string())?;
    let client = host.http.clone();
    let url = url.to_string();
    runtime.block_on(async move {
        let response = client
            .get(&url)
            .send()
            .await
            .map_err(|e| format!("request to {} failed: {}", url, e))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| format!("reading {} failed: {}", url, e))?;
        if !status.is_success() {
            return Err(format!("{} returned {}", url, status));
        }
        Ok(body)
    })
}

pub fn fetch_text(host: &HostContext, args: &[Value]) -> HostResult {
    fetch_body(host, arg_str(args, 0, "url")?).map(Value::String)
}

pub fn fetch_json(host: &HostContext, args: &[Value]) -> HostResult {
    let body = fetch_body(host, arg_str(args, 0, "url")?)?;
    serde_json::from_str(&body).map_err(|e| format!("response is not JSON: {}", e))
}

// ── vector ────────────────────────────────────────────────────────────

pub fn sum(_host: &HostContext, args: &[Value]) -> HostResult {
    number(arg_numbers(args, 0, "values")?.iter().sum())
}

pub fn mean(_host: &HostContext, args: &[Value]) -> HostResult {
    let values = arg_numbers(args, 0, "values")?;
    if values.is_empty() {
        return Err("mean of an empty array".to_string());
    }
    number(values.iter().sum::<f64>() / values.len() as f64)
}

pub fn median(_host: &HostContext, args: &[Value]) -> HostResult {
    let mut values = arg_numbers(args, 0, "values")?;
    if values.is_empty() {
        return Err("median of an empty array".to_string());
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        number((values[mid - 1] + values[mid]) / 2.0)
    } else {
        number(values[mid])
    }
}

/// Population standard deviation.
pub fn stddev(_host: &HostContext, args: &[Value]) -> HostResult {
    let values = arg_numbers(args, 0, "values")?;
    if values.is_empty() {
        return Err("stddev of an empty array".to_string());
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    number(variance.sqrt())
}

pub fn dot(_host: &HostContext, args: &[Value]) -> HostResult {
    let a = arg_numbers(args, 0, "a")?;
    let b = arg_numbers(args, 1, "b")?;
    if a.len() != b.len() {
        return Err(format!("length mismatch: {} vs {}", a.len(), b.len()));
    }
    number(a.iter().zip(&b).map(|(x, y)| x * y).sum())
}

pub fn cumsum(_host: &HostContext, args: &[Value]) -> HostResult {
    let mut total = 0.0;
    let mut out = Vec::new();
    for v in arg_numbers(args, 0, "values")? {
        total += v;
        out.push(number(total)?);
    }
    Ok(Value::Array(out))
}

// ── geospatial ────────────────────────────────────────────────────────

const EARTH_RADIUS_KM: f64 = 6371.0088;

pub fn haversine_km(_host: &HostContext, args: &[Value]) -> HostResult {
    let lat1 = arg_f64(args, 0, "lat1")?.to_radians();
    let lon1 = arg_f64(args, 1, "lon1")?.to_radians();
    let lat2 = arg_f64(args, 2, "lat2")?.to_radians();
    let lon2 = arg_f64(args, 3, "lon2")?.to_radians();
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    number(2.0 * EARTH_RADIUS_KM * a.sqrt().asin())
}

// ── graph ─────────────────────────────────────────────────────────────

fn node_name(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Undirected adjacency from `[[a, b], [a, b, weight], ...]`.
fn adjacency(edges: &Value) -> Result<BTreeMap<String, Vec<(String, f64)>>, String> {
    let edges = edges
        .as_array()
        .ok_or_else(|| "edges must be an array of [from, to, weight?]".to_string())?;
    let mut graph: BTreeMap<String, Vec<(String, f64)>> = BTreeMap::new();
    for edge in edges {
        let parts = edge
            .as_array()
            .filter(|p| p.len() == 2 || p.len() == 3)
            .ok_or_else(|| format!("invalid edge {}", edge))?;
        let from = node_name(&parts[0]).ok_or_else(|| format!("invalid node in {}", edge))?;
        let to = node_name(&parts[1]).ok_or_else(|| format!("invalid node in {}", edge))?;
        let weight = match parts.get(2) {
            Some(w) => w
                .as_f64()
                .filter(|w| *w >= 0.0)
                .ok_or_else(|| format!("invalid weight in {}", edge))?,
            None => 1.0,
        };
        graph.entry(from.clone()).or_default().push((to.clone(), weight));
        graph.entry(to).or_default().push((from, weight));
    }
    Ok(graph)
}

/// Dijkstra over an undirected graph. Returns `{distance, path}` or null.
pub fn shortest_path(_host: &HostContext, args: &[Value]) -> HostResult {
    let graph = adjacency(arg(args, 0, "edges")?)?;
    let start = node_name(arg(args, 1, "from")?).ok_or("invalid 'from' node")?;
    let goal = node_name(arg(args, 2, "to")?).ok_or("invalid 'to' node")?;
    if !graph.contains_key(&start) || !graph.contains_key(&goal) {
        return Ok(Value::Null);
    }

    // Distances are scaled to integers so the heap can order them.
    let scale = 1_000_000.0;
    let mut best: HashMap<&str, u64> = HashMap::new();
    let mut previous: HashMap<&str, &str> = HashMap::new();
    let mut heap = BinaryHeap::new();
    best.insert(start.as_str(), 0);
    heap.push(Reverse((0u64, start.as_str())));

    while let Some(Reverse((dist, node))) = heap.pop() {
        if node == goal {
            break;
        }
        if best.get(node).is_some_and(|d| dist > *d) {
            continue;
        }
        for (next, weight) in &graph[node] {
            let candidate = dist + (weight * scale).round() as u64;
            if best.get(next.as_str()).is_none_or(|d| candidate < *d) {
                best.insert(next.as_str(), candidate);
                previous.insert(next.as_str(), node);
                heap.push(Reverse((candidate, next.as_str())));
            }
        }
    }

    let Some(total) = best.get(goal.as_str()) else {
        return Ok(Value::Null);
    };
    let mut path = vec![goal.as_str()];
    let mut cursor = goal.as_str();
    while let Some(prev) = previous.get(cursor) {
        path.push(prev);
        cursor = prev;
    }
    path.reverse();
    Ok(json!({"distance": *total as f64 / scale, "path": path}))
}

pub fn connected_components(_host: &HostContext, args: &[Value]) -> HostResult {
    let graph = adjacency(arg(args, 0, "edges")?)?;
    let mut seen: BTreeSet<&str> = BTreeSet::new();
    let mut components = Vec::new();
    for root in graph.keys() {
        if !seen.insert(root.as_str()) {
            continue;
        }
        let mut component = vec![root.as_str()];
        let mut stack = vec![root.as_str()];
        while let Some(node) = stack.pop() {
            for (next, _) in &graph[node] {
                if seen.insert(next.as_str()) {
                    component.push(next.as_str());
                    stack.push(next.as_str());
                }
            }
        }
        component.sort();
        components.push(component);
    }
    Ok(json!(components))
}

// ── image ─────────────────────────────────────────────────────────────

fn open_image(host: &HostContext, path: &str) -> Result<image::DynamicImage, String> {
    let resolved = resolve(host, path);
    image::open(&resolved).map_err(|e| format!("cannot decode {}: {}", resolved.display(), e))
}

pub fn image_info(host: &HostContext, args: &[Value]) -> HostResult {
    let img = open_image(host, arg_str(args, 0, "path")?)?;
    Ok(json!({
        "width": img.width(),
        "height": img.height(),
        "color": format!("{:?}", img.color()),
    }))
}

pub fn image_pixel(host: &HostContext, args: &[Value]) -> HostResult {
    use image::GenericImageView;
    let img = open_image(host, arg_str(args, 0, "path")?)?;
    let x = arg_f64(args, 1, "x")? as u32;
    let y = arg_f64(args, 2, "y")? as u32;
    if x >= img.width() || y >= img.height() {
        return Err(format!(
            "pixel ({}, {}) outside {}x{} image",
            x,
            y,
            img.width(),
            img.height()
        ));
    }
    let pixel = img.get_pixel(x, y);
    Ok(json!(pixel.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn host(dir: &std::path::Path) -> HostContext {
        HostContext::new(reqwest::Client::new(), dir.to_path_buf(), None)
    }

    #[test]
    fn test_vector_statistics() {
        let dir = tempfile::tempdir().unwrap();
        let h = host(dir.path());
        let values = [json!([1, 2, 3, 4])];
        assert_eq!(sum(&h, &values).unwrap(), json!(10.0));
        assert_eq!(mean(&h, &values).unwrap(), json!(2.5));
        assert_eq!(median(&h, &values).unwrap(), json!(2.5));
        assert_eq!(median(&h, &[json!([5, 1, 3])]).unwrap(), json!(3.0));
        assert_eq!(cumsum(&h, &values).unwrap(), json!([1.0, 3.0, 6.0, 10.0]));
        assert_eq!(dot(&h, &[json!([1, 2]), json!([3, 4])]).unwrap(), json!(11.0));
        let sd = stddev(&h, &[json!([2, 4, 4, 4, 5, 5, 7, 9])]).unwrap();
        assert_eq!(sd, json!(2.0));
    }

    #[test]
    fn test_vector_errors_are_messages() {
        let dir = tempfile::tempdir().unwrap();
        let h = host(dir.path());
        assert!(mean(&h, &[json!([])]).unwrap_err().contains("empty"));
        assert!(sum(&h, &[json!(["x"])]).unwrap_err().contains("non-numeric"));
        assert!(sum(&h, &[]).unwrap_err().contains("missing argument"));
        assert!(dot(&h, &[json!([1]), json!([1, 2])]).unwrap_err().contains("mismatch"));
    }

    #[test]
    fn test_haversine_london_paris() {
        let dir = tempfile::tempdir().unwrap();
        let h = host(dir.path());
        let km = haversine_km(
            &h,
            &[json!(51.5074), json!(-0.1278), json!(48.8566), json!(2.3522)],
        )
        .unwrap()
        .as_f64()
        .unwrap();
        assert!((km - 343.5).abs() < 1.0, "got {km}");
    }

    #[test]
    fn test_shortest_path_prefers_lighter_route() {
        let dir = tempfile::tempdir().unwrap();
        let h = host(dir.path());
        let edges = json!([["a", "b", 1], ["b", "c", 1], ["a", "c", 5], ["d", "e"]]);
        let result = shortest_path(&h, &[edges.clone(), json!("a"), json!("c")]).unwrap();
        assert_eq!(result["distance"], json!(2.0));
        assert_eq!(result["path"], json!(["a", "b", "c"]));

        let unreachable = shortest_path(&h, &[edges.clone(), json!("a"), json!("e")]).unwrap();
        assert!(unreachable.is_null());

        let components = connected_components(&h, &[edges]).unwrap();
        assert_eq!(components, json!([["a", "b", "c"], ["d", "e"]]));
    }

    #[test]
    fn test_parse_csv_types_cells() {
        let dir = tempfile::tempdir().unwrap();
        let h = host(dir.path());
        let rows = parse_csv(&h, &[json!("name,score\nAlice, 85\nBob,92.5\n")]).unwrap();
        assert_eq!(
            rows,
            json!([{"name": "Alice", "score": 85}, {"name": "Bob", "score": 92.5}])
        );
        let semi = parse_csv(&h, &[json!("a;b\n1;2"), json!(";")]).unwrap();
        assert_eq!(semi, json!([{"a": 1, "b": 2}]));
    }

    #[test]
    fn test_files_resolve_relative_to_work_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("data.json"), r#"{"k": [1, 2]}"#).unwrap();
        let h = host(dir.path());
        assert_eq!(read_json(&h, &[json!("data.json")]).unwrap(), json!({"k": [1, 2]}));
        assert_eq!(file_exists(&h, &[json!("data.json")]).unwrap(), json!(true));
        assert_eq!(file_exists(&h, &[json!("nope.txt")]).unwrap(), json!(false));
        assert_eq!(read_base64(&h, &[json!("data.json")]).unwrap().as_str().unwrap().len() % 4, 0);
        let listing = list_dir(&h, &[]).unwrap();
        assert_eq!(listing.as_array().unwrap().len(), 1);
        assert!(read_text(&h, &[json!("missing.txt")]).unwrap_err().contains("cannot read"));
    }

    #[test]
    fn test_relative_work_dir_reads_recorded_artifact_paths() {
        let cwd_dir = tempfile::Builder::new()
            .prefix("work-")
            .tempdir_in(".")
            .unwrap();
        let relative = PathBuf::from(cwd_dir.path().file_name().unwrap());
        let visit = relative.join("20261016T000000_ab12cd34");
        std::fs::create_dir_all(&visit).unwrap();
        std::fs::write(visit.join("data.csv"), "score\n4\n").unwrap();

        let h = host(&relative);
        assert!(h.work_dir.is_absolute());

        // artifacts are recorded under the absolute work dir
        let recorded = h.work_dir.join("20261016T000000_ab12cd34/data.csv");
        assert_eq!(
            read_text(&h, &[json!(recorded.to_string_lossy())]).unwrap(),
            json!("score\n4\n")
        );
        assert_eq!(
            read_text(&h, &[json!("20261016T000000_ab12cd34/data.csv")]).unwrap(),
            json!("score\n4\n")
        );
    }

    #[test]
    fn test_unzip_round_trip_of_written_archive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.zip");
        {
            let file = std::fs::File::create(&path).unwrap();
            let mut writer = zip::ZipWriter::new(file);
            writer
                .start_file("inner/notes.txt", zip::write::FileOptions::default())
                .unwrap();
            writer.write_all(b"secret code 42").unwrap();
            writer.finish().unwrap();
        }
        let h = host(dir.path());
        assert_eq!(
            unzip_list(&h, &[json!("bundle.zip")]).unwrap(),
            json!(["inner/notes.txt"])
        );
        assert_eq!(
            unzip_text(&h, &[json!("bundle.zip"), json!("inner/notes.txt")]).unwrap(),
            json!("secret code 42")
        );
    }

    #[test]
    fn test_image_info_and_pixel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dot.png");
        let mut img = image::RgbaImage::new(3, 2);
        img.put_pixel(1, 1, image::Rgba([255, 0, 0, 255]));
        img.save(&path).unwrap();

        let h = host(dir.path());
        let info = image_info(&h, &[json!("dot.png")]).unwrap();
        assert_eq!(info["width"], json!(3));
        assert_eq!(info["height"], json!(2));
        assert_eq!(
            image_pixel(&h, &[json!("dot.png"), json!(1), json!(1)]).unwrap(),
            json!([255, 0, 0, 255])
        );
        assert!(image_pixel(&h, &[json!("dot.png"), json!(9), json!(0)]).is_err());
    }

    #[test]
    fn test_fetch_without_runtime_is_an_error_message() {
        let dir = tempfile::tempdir().unwrap();
        let h = host(dir.path());
        let err = fetch_text(&h, &[json!("http://127.0.0.1:9/")]).unwrap_err();
        assert!(err.contains("async runtime"));
    }
}
