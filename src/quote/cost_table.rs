//! Cost-table repository (CSV).
//!
//! Loads courier cost rows from CSV files in a directory, indexes them by
//! route and courier, and serves ranked candidates for a quote request.
//! Files are re-read when their mtime/size signature changes. The richer
//! spreadsheet pipeline lives with the external collaborator; this loader
//! implements the same `find_candidates` contract.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

const COURIER_ALIASES: &[(&str, &str)] = &[
    ("圆通", "圆通"),
    ("圆通快递", "圆通"),
    ("韵达", "韵达"),
    ("韵达快递", "韵达"),
    ("中通", "中通"),
    ("中通快递", "中通"),
    ("申通", "申通"),
    ("申通快递", "申通"),
    ("菜鸟", "菜鸟裹裹"),
    ("菜鸟裹裹", "菜鸟裹裹"),
    ("极兔", "极兔"),
    ("极兔速递", "极兔"),
    ("德邦", "德邦"),
    ("德邦快递", "德邦"),
    ("顺丰", "顺丰"),
    ("顺丰速运", "顺丰"),
    ("京东", "京东"),
    ("京东物流", "京东"),
    ("邮政", "邮政"),
    ("中国邮政", "邮政"),
    ("ems", "邮政"),
];

const PROVINCES: &[&str] = &[
    "北京", "上海", "天津", "重庆", "河北", "山西", "辽宁", "吉林", "黑龙江", "江苏", "浙江",
    "安徽", "福建", "江西", "山东", "河南", "湖北", "湖南", "广东", "海南", "四川", "贵州",
    "云南", "陕西", "甘肃", "青海", "台湾", "内蒙古", "广西", "西藏", "宁夏", "新疆", "香港",
    "澳门",
];

const CITY_TO_PROVINCE: &[(&str, &str)] = &[
    ("石家庄", "河北"),
    ("太原", "山西"),
    ("沈阳", "辽宁"),
    ("长春", "吉林"),
    ("哈尔滨", "黑龙江"),
    ("南京", "江苏"),
    ("杭州", "浙江"),
    ("合肥", "安徽"),
    ("福州", "福建"),
    ("南昌", "江西"),
    ("济南", "山东"),
    ("郑州", "河南"),
    ("武汉", "湖北"),
    ("长沙", "湖南"),
    ("广州", "广东"),
    ("深圳", "广东"),
    ("海口", "海南"),
    ("成都", "四川"),
    ("贵阳", "贵州"),
    ("昆明", "云南"),
    ("西安", "陕西"),
    ("兰州", "甘肃"),
    ("西宁", "青海"),
    ("呼和浩特", "内蒙古"),
    ("南宁", "广西"),
    ("拉萨", "西藏"),
    ("银川", "宁夏"),
    ("乌鲁木齐", "新疆"),
];

const LOCATION_SUFFIXES: &[&str] = &[
    "特别行政区",
    "自治区",
    "自治州",
    "地区",
    "省",
    "市",
    "盟",
    "区",
    "县",
];

pub fn normalize_courier_name(name: &str) -> String {
    let raw = name.trim();
    if raw.is_empty() {
        return String::new();
    }
    let lowered = raw.to_lowercase();
    for (alias, canonical) in COURIER_ALIASES {
        if *alias == lowered || *alias == raw {
            return (*canonical).to_string();
        }
    }
    let compact = raw
        .replace("速递", "")
        .replace("物流", "")
        .replace("快递", "");
    let compact = compact.trim();
    for (alias, canonical) in COURIER_ALIASES {
        if *alias == compact {
            return (*canonical).to_string();
        }
    }
    if compact.is_empty() {
        raw.to_string()
    } else {
        compact.to_string()
    }
}

/// Fold a location spelling down to its canonical short name
/// (`浙江省` → `浙江`, `北京市` → `北京`).
pub fn normalize_location_name(value: &str) -> String {
    let text: String = value.chars().filter(|c| !c.is_whitespace()).collect();
    if text.is_empty() {
        return String::new();
    }
    let base = LOCATION_SUFFIXES
        .iter()
        .find_map(|s| text.strip_suffix(s))
        .unwrap_or(&text);
    base.to_string()
}

pub fn region_of_location(value: &str) -> String {
    let name = normalize_location_name(value);
    if name.is_empty() {
        return String::new();
    }
    if PROVINCES.contains(&name.as_str()) {
        return name;
    }
    CITY_TO_PROVINCE
        .iter()
        .find(|(city, _)| *city == name)
        .map(|(_, province)| (*province).to_string())
        .unwrap_or_default()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostRecord {
    pub courier: String,
    pub origin: String,
    pub destination: String,
    pub first_cost: f64,
    pub extra_cost: f64,
    pub throw_ratio: Option<f64>,
    pub source_file: String,
}

#[derive(Default)]
struct Indexes {
    by_route: HashMap<(String, String), Vec<usize>>,
    by_courier_route: HashMap<(String, String, String), Vec<usize>>,
    by_destination: HashMap<String, Vec<usize>>,
    by_courier_destination: HashMap<(String, String), Vec<usize>>,
}

#[derive(Default)]
struct TableState {
    records: Vec<CostRecord>,
    signature: Vec<(PathBuf, u64, u64)>,
    indexes: Indexes,
}

pub struct CostTableRepository {
    table_dir: PathBuf,
    state: Mutex<TableState>,
}

impl CostTableRepository {
    pub fn new(table_dir: impl Into<PathBuf>) -> Self {
        Self {
            table_dir: table_dir.into(),
            state: Mutex::new(TableState::default()),
        }
    }

    /// Ranked cost rows for (origin, destination, courier). Exact route
    /// matches win; otherwise destination matches ranked by origin
    /// similarity. Sorted cheapest-first.
    pub fn find_candidates(
        &self,
        origin: &str,
        destination: &str,
        courier: Option<&str>,
        limit: usize,
    ) -> Vec<CostRecord> {
        let mut state = self.state.lock();
        Self::reload_if_needed(&self.table_dir, &mut state);
        if state.records.is_empty() {
            return Vec::new();
        }

        let origin_norm = normalize_location_name(origin);
        let destination_norm = normalize_location_name(destination);
        if origin_norm.is_empty() || destination_norm.is_empty() {
            return Vec::new();
        }
        let courier_norm = courier
            .map(normalize_courier_name)
            .filter(|c| !c.is_empty() && c != "auto");

        let limit = limit.max(1);
        let pick = |indices: &[usize]| -> Vec<CostRecord> {
            indices.iter().map(|&i| state.records[i].clone()).collect()
        };

        if let Some(courier_norm) = &courier_norm {
            if let Some(indices) = state.indexes.by_courier_route.get(&(
                courier_norm.clone(),
                origin_norm.clone(),
                destination_norm.clone(),
            )) {
                let mut exact = pick(indices);
                sort_by_cost(&mut exact);
                exact.truncate(limit);
                return exact;
            }
            let pool = state
                .indexes
                .by_courier_destination
                .get(&(courier_norm.clone(), destination_norm.clone()))
                .map(|v| pick(v))
                .unwrap_or_default();
            let mut ranked = rank_by_origin_similarity(pool, &origin_norm);
            ranked.truncate(limit);
            return ranked;
        }

        if let Some(indices) = state
            .indexes
            .by_route
            .get(&(origin_norm.clone(), destination_norm.clone()))
        {
            let mut exact = pick(indices);
            sort_by_cost(&mut exact);
            exact.truncate(limit);
            return exact;
        }

        let pool = state
            .indexes
            .by_destination
            .get(&destination_norm)
            .map(|v| pick(v))
            .unwrap_or_default();
        let mut ranked = rank_by_origin_similarity(pool, &origin_norm);
        ranked.truncate(limit);
        ranked
    }

    pub fn record_count(&self) -> usize {
        let mut state = self.state.lock();
        Self::reload_if_needed(&self.table_dir, &mut state);
        state.records.len()
    }

    fn reload_if_needed(table_dir: &Path, state: &mut TableState) {
        let files = Self::collect_files(table_dir);
        let signature: Vec<(PathBuf, u64, u64)> = files
            .iter()
            .filter_map(|p| {
                let meta = std::fs::metadata(p).ok()?;
                let mtime = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_nanos() as u64)
                    .unwrap_or(0);
                Some((p.clone(), mtime, meta.len()))
            })
            .collect();
        if signature == state.signature {
            return;
        }

        let mut records = Vec::new();
        for path in &files {
            match Self::load_csv(path) {
                Ok(mut rows) => records.append(&mut rows),
                Err(e) => warn!(path = %path.display(), error = %e, "cost table load failed"),
            }
        }

        let mut indexes = Indexes::default();
        for (i, record) in records.iter().enumerate() {
            let courier = normalize_courier_name(&record.courier);
            let origin = normalize_location_name(&record.origin);
            let destination = normalize_location_name(&record.destination);
            if courier.is_empty() || origin.is_empty() || destination.is_empty() {
                continue;
            }
            indexes
                .by_route
                .entry((origin.clone(), destination.clone()))
                .or_default()
                .push(i);
            indexes
                .by_courier_route
                .entry((courier.clone(), origin, destination.clone()))
                .or_default()
                .push(i);
            indexes
                .by_destination
                .entry(destination.clone())
                .or_default()
                .push(i);
            indexes
                .by_courier_destination
                .entry((courier, destination))
                .or_default()
                .push(i);
        }

        state.records = records;
        state.signature = signature;
        state.indexes = indexes;
    }

    fn collect_files(table_dir: &Path) -> Vec<PathBuf> {
        if table_dir.is_file() {
            return vec![table_dir.to_path_buf()];
        }
        let Ok(entries) = std::fs::read_dir(table_dir) else {
            return Vec::new();
        };
        let mut files: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.is_file()
                    && p.extension()
                        .map(|ext| ext.eq_ignore_ascii_case("csv"))
                        .unwrap_or(false)
            })
            .collect();
        files.sort();
        files
    }

    fn load_csv(path: &Path) -> std::io::Result<Vec<CostRecord>> {
        let text = std::fs::read_to_string(path)?;
        let source_file = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let rows: Vec<Vec<String>> = text
            .lines()
            .map(|line| {
                line.split(',')
                    .map(|cell| cell.trim().trim_matches('"').to_string())
                    .collect::<Vec<_>>()
            })
            .filter(|cells: &Vec<String>| cells.iter().any(|c| !c.is_empty()))
            .collect();

        let Some((header_idx, header_map)) = rows
            .iter()
            .enumerate()
            .find_map(|(i, row)| Self::resolve_header_map(row).map(|m| (i, m)))
        else {
            return Ok(Vec::new());
        };

        let mut records = Vec::new();
        for row in rows.iter().skip(header_idx + 1) {
            let cell = |key: &str| -> String {
                header_map
                    .get(key)
                    .and_then(|&i| row.get(i))
                    .cloned()
                    .unwrap_or_default()
            };
            let courier = cell("courier");
            let origin = cell("origin");
            let destination = cell("destination");
            let first_cost = parse_number(&cell("first_cost"));
            let extra_cost = parse_number(&cell("extra_cost"));
            let throw_ratio = parse_number(&cell("throw_ratio"));

            if courier.is_empty() || origin.is_empty() || destination.is_empty() {
                continue;
            }
            let (Some(first_cost), Some(extra_cost)) = (first_cost, extra_cost) else {
                continue;
            };

            records.push(CostRecord {
                courier: normalize_courier_name(&courier),
                origin,
                destination,
                first_cost,
                extra_cost,
                throw_ratio,
                source_file: source_file.clone(),
            });
        }
        Ok(records)
    }

    fn resolve_header_map(headers: &[String]) -> Option<HashMap<String, usize>> {
        let mut mapped: HashMap<String, usize> = HashMap::new();
        for (index, raw) in headers.iter().enumerate() {
            let cell: String = raw
                .trim()
                .to_lowercase()
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect();
            if cell.is_empty() {
                continue;
            }
            let key = if ["快递公司", "物流公司", "承运商"].contains(&cell.as_str()) {
                "courier"
            } else if ["始发地", "寄件地", "发件地", "发货地", "始发城市"].contains(&cell.as_str()) {
                "origin"
            } else if ["目的地", "收件地", "收件地址", "收件城市", "到达地"].contains(&cell.as_str())
            {
                "destination"
            } else if cell.contains("首重") {
                "first_cost"
            } else if cell.contains("续重") {
                "extra_cost"
            } else if ["抛比", "抛重比", "材积比", "体积系数"].contains(&cell.as_str()) {
                "throw_ratio"
            } else {
                continue;
            };
            mapped.entry(key.to_string()).or_insert(index);
        }

        let required = ["courier", "origin", "destination", "first_cost", "extra_cost"];
        if required.iter().all(|k| mapped.contains_key(*k)) {
            Some(mapped)
        } else {
            None
        }
    }
}

fn parse_number(raw: &str) -> Option<f64> {
    let text = raw.replace('，', ",").replace(',', "");
    let mut start = None;
    let mut end = 0;
    for (i, c) in text.char_indices() {
        if c.is_ascii_digit() || c == '.' || (c == '-' && start.is_none()) {
            if start.is_none() {
                start = Some(i);
            }
            end = i + c.len_utf8();
        } else if start.is_some() {
            break;
        }
    }
    start.and_then(|s| text[s..end].parse().ok())
}

fn sort_by_cost(records: &mut [CostRecord]) {
    records.sort_by(|a, b| {
        let ka = (a.first_cost + a.extra_cost, a.first_cost, a.extra_cost);
        let kb = (b.first_cost + b.extra_cost, b.first_cost, b.extra_cost);
        ka.partial_cmp(&kb)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.courier.cmp(&b.courier))
    });
}

fn origin_similarity(request_origin: &str, row_origin: &str) -> u8 {
    if request_origin.is_empty() || row_origin.is_empty() {
        return 0;
    }
    if request_origin == row_origin {
        return 4;
    }
    if request_origin.contains(row_origin) || row_origin.contains(request_origin) {
        return 3;
    }
    let request_region = region_of_location(request_origin);
    let row_region = region_of_location(row_origin);
    if !request_region.is_empty()
        && request_region == row_region
        && (PROVINCES.contains(&request_origin) || PROVINCES.contains(&row_origin))
    {
        return 2;
    }
    let req: Vec<char> = request_origin.chars().collect();
    let row: Vec<char> = row_origin.chars().collect();
    if req.len() >= 2 && row.len() >= 2 && req[..2] == row[..2] {
        return 1;
    }
    0
}

fn rank_by_origin_similarity(pool: Vec<CostRecord>, origin_norm: &str) -> Vec<CostRecord> {
    let mut ranked: Vec<(u8, CostRecord)> = pool
        .into_iter()
        .filter_map(|record| {
            let row_origin = normalize_location_name(&record.origin);
            let score = origin_similarity(origin_norm, &row_origin);
            (score > 0).then_some((score, record))
        })
        .collect();
    ranked.sort_by(|(sa, a), (sb, b)| {
        sb.cmp(sa).then_with(|| {
            let ka = (a.first_cost + a.extra_cost, a.first_cost);
            let kb = (b.first_cost + b.extra_cost, b.first_cost);
            ka.partial_cmp(&kb).unwrap_or(std::cmp::Ordering::Equal)
        })
    });
    ranked.into_iter().map(|(_, r)| r).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE_CSV: &str = "快递公司,始发地,目的地,首重1kg,续重1kg,抛比\n\
圆通,浙江省,北京,4.5,1.2,8000\n\
中通,浙江,北京市,4.8,1.1,\n\
顺丰,上海,北京,12.0,4.0,6000\n\
圆通,浙江,上海,4.0,1.0,8000\n";

    fn repo_with_sample() -> (tempfile::TempDir, CostTableRepository) {
        let dir = tempfile::tempdir().unwrap();
        let mut f = std::fs::File::create(dir.path().join("table.csv")).unwrap();
        f.write_all(SAMPLE_CSV.as_bytes()).unwrap();
        let repo = CostTableRepository::new(dir.path());
        (dir, repo)
    }

    #[test]
    fn loads_and_indexes_csv_rows() {
        let (_dir, repo) = repo_with_sample();
        assert_eq!(repo.record_count(), 4);
    }

    #[test]
    fn exact_route_matches_sorted_by_cost() {
        let (_dir, repo) = repo_with_sample();
        let candidates = repo.find_candidates("浙江省", "北京市", None, 10);
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].courier, "圆通");
    }

    #[test]
    fn courier_filter_narrows_candidates() {
        let (_dir, repo) = repo_with_sample();
        let candidates = repo.find_candidates("浙江", "北京", Some("中通快递"), 10);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].courier, "中通");
    }

    #[test]
    fn city_origin_ranks_same_province_rows() {
        let (_dir, repo) = repo_with_sample();
        // 杭州 is in 浙江; province-level rows should still match.
        let candidates = repo.find_candidates("杭州", "北京", None, 10);
        assert!(!candidates.is_empty());
        assert!(candidates.iter().all(|r| r.destination.contains("北京")));
    }

    #[test]
    fn courier_aliases_normalize() {
        assert_eq!(normalize_courier_name("圆通快递"), "圆通");
        assert_eq!(normalize_courier_name("顺丰速运"), "顺丰");
        assert_eq!(normalize_courier_name("EMS"), "邮政");
    }

    #[test]
    fn location_suffixes_fold() {
        assert_eq!(normalize_location_name("浙江省"), "浙江");
        assert_eq!(normalize_location_name("北京市"), "北京");
        assert_eq!(region_of_location("深圳"), "广东");
    }
}
