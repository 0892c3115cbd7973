use std::collections::BTreeSet;

use crate::{Catalog, DataProductDefinition, MetricDefinition};

/// Bonus for a query that names a metric id verbatim.
const EXACT_ID_BONUS: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CatalogEntry<'a> {
    Metric(&'a MetricDefinition),
    DataProduct(&'a DataProductDefinition),
}

impl<'a> CatalogEntry<'a> {
    pub fn id(&self) -> &'a str {
        match self {
            CatalogEntry::Metric(m) => m.id.as_str(),
            CatalogEntry::DataProduct(p) => p.id.as_str(),
        }
    }

    pub fn name(&self) -> &'a str {
        match self {
            CatalogEntry::Metric(m) => m.name.as_str(),
            CatalogEntry::DataProduct(p) => p.name.as_str(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CatalogEntry::Metric(_) => "metric",
            CatalogEntry::DataProduct(_) => "data_product",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit<'a> {
    pub entry: CatalogEntry<'a>,
    pub score: f64,
}

/// Lowercase alphanumeric tokens of length >= 2, with a trailing plural `s`
/// dropped, de-duplicated in first-seen order.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for raw in text
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| t.len() >= 2)
    {
        let mut token = raw.to_ascii_lowercase();
        if token.len() > 3 && token.ends_with('s') && !token.ends_with("ss") {
            token.pop();
        }
        if seen.insert(token.clone()) {
            out.push(token);
        }
    }
    out
}

impl Catalog {
    /// Ranks every entry by the share of query tokens it contains.
    ///
    /// Metrics come before data products in insertion order, and the sort is
    /// stable, so equal scores keep catalog order.
    pub fn search(&self, query: &str, limit: usize) -> Vec<SearchHit<'_>> {
        let query_tokens = tokenize(query);
        if query_tokens.is_empty() || limit == 0 {
            return Vec::new();
        }
        let query_words = id_words(query);

        let entries = self
            .metrics()
            .iter()
            .map(CatalogEntry::Metric)
            .chain(self.data_products().iter().map(CatalogEntry::DataProduct));

        let mut hits = entries
            .filter_map(|entry| {
                let score = score_entry(&entry, &query_tokens, &query_words);
                (score > 0.0).then_some(SearchHit { entry, score })
            })
            .collect::<Vec<_>>();

        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(limit);
        hits
    }

    pub fn suggested_metric(&self, query: &str) -> Option<&MetricDefinition> {
        self.search(query, usize::MAX)
            .into_iter()
            .find_map(|hit| match hit.entry {
                CatalogEntry::Metric(metric) => Some(metric),
                CatalogEntry::DataProduct(_) => None,
            })
    }
}

/// Whole identifier-shaped words of the query, so `npa_ratio_trend` does not
/// count as naming `npa_ratio`.
fn id_words(query: &str) -> BTreeSet<String> {
    query
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|word| !word.is_empty())
        .map(str::to_ascii_lowercase)
        .collect()
}

fn score_entry(
    entry: &CatalogEntry<'_>,
    query_tokens: &[String],
    query_words: &BTreeSet<String>,
) -> f64 {
    let mut text = String::new();
    let mut exact_id = false;
    match entry {
        CatalogEntry::Metric(m) => {
            text.push_str(&m.id.replace('_', " "));
            text.push(' ');
            text.push_str(&m.name);
            text.push(' ');
            text.push_str(&m.description);
            text.push(' ');
            text.push_str(&m.synonyms.join(" "));
            text.push(' ');
            text.push_str(&m.data_product.replace('_', " "));
            exact_id = query_words.contains(m.id.as_str());
        }
        CatalogEntry::DataProduct(p) => {
            text.push_str(&p.id.as_str().replace('_', " "));
            text.push(' ');
            text.push_str(&p.name);
            text.push(' ');
            text.push_str(&p.description);
        }
    }

    let entry_tokens = tokenize(&text).into_iter().collect::<BTreeSet<_>>();
    let matched = query_tokens
        .iter()
        .filter(|t| entry_tokens.contains(*t))
        .count();

    let mut score = matched as f64 / query_tokens.len() as f64;
    if exact_id {
        score += EXACT_ID_BONUS;
    }
    score
}
