//! Catch report listing adapter: one HTML card per shop per day, one table row per species.

use chrono::NaiveDate;
use choka_core::{Availability, CatchReport, SourceKind};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::text::{find_report_date, strip_parenthetical, text_or_none};
use crate::{AdapterContext, AdapterError, FetchedPage, SourceAdapter};

/// Problems confined to a single card or row; the rest of the page is still parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseFieldError {
    #[error("card {card} has no shop name")]
    MissingShop { card: usize },
    #[error("card {card} ({shop}) has no YYYY年MM月DD日 date")]
    MissingDate { card: usize, shop: String },
    #[error("card {card} ({shop}) has invalid date {text:?}")]
    InvalidDate { card: usize, shop: String, text: String },
    #[error("card {card} ({shop}) row {row} has no species name")]
    EmptySpecies { card: usize, shop: String, row: usize },
}

impl ParseFieldError {
    /// Whole-card problems drop every row of the card.
    pub fn skips_card(&self) -> bool {
        !matches!(self, ParseFieldError::EmptySpecies { .. })
    }
}

/// CSS selectors describing the listing markup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportSelectors {
    pub card: String,
    pub shop: String,
    pub date: String,
    pub prefecture: Option<String>,
    pub row: String,
    pub cell: String,
}

impl Default for ReportSelectors {
    fn default() -> Self {
        Self {
            card: "div.choka-card".to_string(),
            shop: ".shop-name".to_string(),
            date: ".report-date".to_string(),
            prefecture: Some(".area".to_string()),
            row: "table tr".to_string(),
            cell: "td".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct CompiledSelectors {
    card: Selector,
    shop: Selector,
    date: Selector,
    prefecture: Option<Selector>,
    row: Selector,
    cell: Selector,
}

fn compile(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Selector {
        selector: selector.to_string(),
        detail: e.to_string(),
    })
}

impl CompiledSelectors {
    fn new(s: &ReportSelectors) -> Result<Self, AdapterError> {
        Ok(Self {
            card: compile(&s.card)?,
            shop: compile(&s.shop)?,
            date: compile(&s.date)?,
            prefecture: s.prefecture.as_deref().map(compile).transpose()?,
            row: compile(&s.row)?,
            cell: compile(&s.cell)?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportBatch {
    pub cards_seen: usize,
    pub reports: Vec<CatchReport>,
    pub issues: Vec<ParseFieldError>,
}

#[derive(Debug, Clone)]
pub struct ReportAdapter {
    url: String,
    default_prefecture: String,
    selectors: CompiledSelectors,
}

impl ReportAdapter {
    pub fn new(
        url: impl Into<String>,
        default_prefecture: impl Into<String>,
        selectors: &ReportSelectors,
    ) -> Result<Self, AdapterError> {
        Ok(Self {
            url: url.into(),
            default_prefecture: default_prefecture.into(),
            selectors: CompiledSelectors::new(selectors)?,
        })
    }

    pub fn parse_html(&self, html: &str) -> Availability<ReportBatch> {
        let document = Html::parse_document(html);
        let cards: Vec<ElementRef<'_>> = document.select(&self.selectors.card).collect();
        if cards.is_empty() {
            return Availability::absent("no report cards on page");
        }

        let mut batch = ReportBatch {
            cards_seen: cards.len(),
            ..Default::default()
        };
        for (index, card) in cards.into_iter().enumerate() {
            self.parse_card(index, card, &mut batch);
        }
        Availability::Present(batch)
    }

    fn parse_card(&self, card_index: usize, card: ElementRef<'_>, batch: &mut ReportBatch) {
        let Some(shop_name) = first_text(card, &self.selectors.shop) else {
            batch
                .issues
                .push(ParseFieldError::MissingShop { card: card_index });
            return;
        };

        let date_text = first_text(card, &self.selectors.date).unwrap_or_else(|| element_text(card));
        let report_date = match find_report_date(&date_text) {
            None => {
                batch.issues.push(ParseFieldError::MissingDate {
                    card: card_index,
                    shop: shop_name,
                });
                return;
            }
            Some((y, m, d)) => match NaiveDate::from_ymd_opt(y, m, d) {
                Some(date) => date,
                None => {
                    batch.issues.push(ParseFieldError::InvalidDate {
                        card: card_index,
                        shop: shop_name,
                        text: date_text,
                    });
                    return;
                }
            },
        };

        let prefecture = self
            .selectors
            .prefecture
            .as_ref()
            .and_then(|sel| first_text(card, sel))
            .unwrap_or_else(|| self.default_prefecture.clone());

        for (row_index, row) in card.select(&self.selectors.row).enumerate() {
            let cells: Vec<String> = row
                .select(&self.selectors.cell)
                .map(element_text)
                .collect();
            // Header rows carry only <th> cells.
            let Some((species_cell, detail_cells)) = cells.split_first() else {
                continue;
            };

            let fish_name = strip_parenthetical(species_cell);
            if fish_name.is_empty() {
                batch.issues.push(ParseFieldError::EmptySpecies {
                    card: card_index,
                    shop: shop_name.clone(),
                    row: row_index,
                });
                continue;
            }

            let details = detail_cells
                .iter()
                .filter(|c| !c.is_empty())
                .cloned()
                .collect::<Vec<_>>()
                .join(" / ");

            batch.reports.push(CatchReport {
                report_date,
                prefecture: prefecture.clone(),
                shop_name: shop_name.clone(),
                fish_name,
                details,
            });
        }
    }
}

fn element_text(element: ElementRef<'_>) -> String {
    text_or_none(&element.text().collect::<String>()).unwrap_or_default()
}

fn first_text(element: ElementRef<'_>, selector: &Selector) -> Option<String> {
    element
        .select(selector)
        .next()
        .and_then(|n| text_or_none(&n.text().collect::<String>()))
}

impl SourceAdapter for ReportAdapter {
    type Output = ReportBatch;

    fn source(&self) -> SourceKind {
        SourceKind::Reports
    }

    fn request_url(&self, _ctx: &AdapterContext) -> String {
        self.url.clone()
    }

    fn parse(
        &self,
        _ctx: &AdapterContext,
        page: &FetchedPage,
    ) -> Result<Availability<ReportBatch>, AdapterError> {
        let html = std::str::from_utf8(&page.body)
            .map_err(|e| AdapterError::format(SourceKind::Reports, "UTF-8 HTML", e, &page.body))?;
        Ok(self.parse_html(html))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> ReportAdapter {
        ReportAdapter::new(
            "https://example.test/choka/kanagawa",
            "神奈川県",
            &ReportSelectors::default(),
        )
        .unwrap()
    }

    fn card(shop: &str, date: &str, rows: &str) -> String {
        format!(
            r#"<div class="choka-card">
                 <h3 class="shop-name">{shop}</h3>
                 <p class="report-date">{date}</p>
                 <table>
                   <tr><th>魚種</th><th>釣果</th><th>サイズ</th></tr>
                   {rows}
                 </table>
               </div>"#
        )
    }

    fn page(cards: &[String]) -> String {
        format!("<html><body>{}</body></html>", cards.join("\n"))
    }

    #[test]
    fn species_annotations_are_stripped_and_details_joined() {
        let html = page(&[card(
            "一之瀬丸",
            "2024年05月01日(水)",
            "<tr><td>マダイ（良型）</td><td>0～3枚</td><td>0.8～2.1kg</td></tr>\
             <tr><td>アジ</td><td>10～42匹</td><td></td></tr>",
        )]);

        let batch = adapter().parse_html(&html).present().unwrap();
        assert_eq!(batch.cards_seen, 1);
        assert!(batch.issues.is_empty());
        assert_eq!(batch.reports.len(), 2);
        let first = &batch.reports[0];
        assert_eq!(first.fish_name, "マダイ");
        assert_eq!(first.shop_name, "一之瀬丸");
        assert_eq!(first.prefecture, "神奈川県");
        assert_eq!(first.details, "0～3枚 / 0.8～2.1kg");
        assert_eq!(first.report_date, NaiveDate::from_ymd_opt(2024, 5, 1).unwrap());
        assert_eq!(batch.reports[1].details, "10～42匹");
    }

    #[test]
    fn card_without_date_contributes_no_rows() {
        let html = page(&[
            card("広漁丸", "本日の釣果", "<tr><td>タチウオ</td><td>3～12本</td></tr>"),
            card("一之瀬丸", "2024年5月1日", "<tr><td>アジ</td><td>10～42匹</td></tr>"),
        ]);

        let batch = adapter().parse_html(&html).present().unwrap();
        assert_eq!(batch.reports.len(), 1);
        assert_eq!(batch.reports[0].shop_name, "一之瀬丸");
        assert_eq!(
            batch.issues,
            vec![ParseFieldError::MissingDate {
                card: 0,
                shop: "広漁丸".into()
            }]
        );
        assert!(batch.issues[0].skips_card());
    }

    #[test]
    fn impossible_calendar_date_skips_the_card() {
        let html = page(&[card("広漁丸", "2024年02月30日", "<tr><td>アジ</td></tr>")]);
        let batch = adapter().parse_html(&html).present().unwrap();
        assert!(batch.reports.is_empty());
        assert!(matches!(batch.issues[0], ParseFieldError::InvalidDate { .. }));
    }

    #[test]
    fn row_without_species_is_skipped_alone() {
        let html = page(&[card(
            "一之瀬丸",
            "2024年05月01日",
            "<tr><td>（船中）</td><td>合計 58匹</td></tr>\
             <tr><td>カワハギ(大型)</td><td>2～9枚</td></tr>",
        )]);

        let batch = adapter().parse_html(&html).present().unwrap();
        assert_eq!(batch.reports.len(), 1);
        assert_eq!(batch.reports[0].fish_name, "カワハギ");
        assert_eq!(
            batch.issues,
            vec![ParseFieldError::EmptySpecies {
                card: 0,
                shop: "一之瀬丸".into(),
                row: 1
            }]
        );
        assert!(!batch.issues[0].skips_card());
    }

    #[test]
    fn card_prefecture_overrides_default() {
        let html = page(&[r#"<div class="choka-card">
                <span class="area">千葉県</span>
                <h3 class="shop-name">勝山丸</h3>
                <p class="report-date">2024年05月01日</p>
                <table><tr><td>ヒラメ</td><td>0～2枚</td></tr></table>
            </div>"#
            .to_string()]);
        let batch = adapter().parse_html(&html).present().unwrap();
        assert_eq!(batch.reports[0].prefecture, "千葉県");
    }

    #[test]
    fn card_without_shop_is_reported() {
        let html = page(&[r#"<div class="choka-card"><p class="report-date">2024年05月01日</p></div>"#.to_string()]);
        let batch = adapter().parse_html(&html).present().unwrap();
        assert!(batch.reports.is_empty());
        assert_eq!(batch.issues, vec![ParseFieldError::MissingShop { card: 0 }]);
    }

    #[test]
    fn page_without_cards_is_absent() {
        let result = adapter().parse_html("<html><body><p>メンテナンス中</p></body></html>");
        assert!(!result.is_present());
    }

    #[test]
    fn malformed_selector_is_rejected_at_construction() {
        let selectors = ReportSelectors {
            card: "div[".to_string(),
            ..Default::default()
        };
        let err = ReportAdapter::new("https://example.test", "神奈川県", &selectors).unwrap_err();
        assert!(matches!(err, AdapterError::Selector { .. }));
    }
}
