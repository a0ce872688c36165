use std::collections::HashSet;

/// Most specific first: `object, area, region`, `object, area`, `object, region`,
/// then the bare object.
pub fn build_queries(objects: &[String], areas: &[String], region_hint: &str) -> Vec<String> {
    let region_hint = region_hint.trim();
    let areas: Vec<&str> = areas
        .iter()
        .map(|area| area.trim())
        .filter(|area| !area.is_empty())
        .collect();

    let mut queries = Vec::new();
    for object in objects.iter().map(|o| o.trim()).filter(|o| !o.is_empty()) {
        let lowered = object.to_lowercase();
        for area in areas.iter().filter(|area| area.to_lowercase() != lowered) {
            queries.push(with_region(&format!("{object}, {area}"), region_hint));
            queries.push(format!("{object}, {area}"));
        }
        queries.push(with_region(object, region_hint));
        queries.push(object.to_string());
    }

    let mut seen = HashSet::new();
    queries.retain(|query| seen.insert(query.to_lowercase()));
    queries
}

fn with_region(base: &str, region_hint: &str) -> String {
    if region_hint.is_empty() {
        base.to_string()
    } else {
        format!("{base}, {region_hint}")
    }
}

pub fn promote_areas(objects: Vec<String>, areas: &[String]) -> Vec<String> {
    if objects.is_empty() {
        areas.to_vec()
    } else {
        objects
    }
}
