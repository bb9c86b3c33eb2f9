use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;

use aggregator::query::{clamp_limit, HistoryPage, HistoryRequest, HistoryView, MinuteSummary};
use aggregator::store::TickRow;

use crate::error::AppError;
use crate::state::AppState;

/// History query string. `cursor` is the older name of `before`; any of
/// `view=ohlc1m`, `agg=1m` or `shape=candle` selects candles.
#[derive(Debug, Default, Deserialize)]
pub struct HistoryParams {
    pub limit: Option<String>,
    pub before: Option<String>,
    pub cursor: Option<String>,
    pub view: Option<String>,
    pub agg: Option<String>,
    pub shape: Option<String>,
}

impl HistoryParams {
    pub fn into_request(self, now_secs: i64) -> Result<HistoryRequest, AppError> {
        let limit = clamp_limit(self.limit.and_then(|l| l.trim().parse::<f64>().ok()));

        let before = match self.before.or(self.cursor) {
            Some(raw) => match raw.trim().parse::<f64>() {
                Ok(n) if n.is_finite() => n.floor() as i64,
                _ => return Err(AppError::BadRequest(format!("invalid cursor: {}", raw))),
            },
            None => now_secs + 1,
        };

        let is = |v: &Option<String>, want: &str| {
            v.as_deref().is_some_and(|s| s.eq_ignore_ascii_case(want))
        };
        let view = if is(&self.view, "ohlc1m") || is(&self.agg, "1m") || is(&self.shape, "candle")
        {
            HistoryView::Ohlc1m
        } else {
            HistoryView::Ticks
        };

        Ok(HistoryRequest {
            before,
            limit,
            view,
        })
    }
}

pub async fn latest_tick(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
) -> Result<Json<TickRow>, AppError> {
    let row = state.aggregator.queries().latest_tick(&symbol).await?;
    Ok(Json(row))
}

pub async fn tick_history(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<HistoryPage>, AppError> {
    let request = params.into_request(chrono::Utc::now().timestamp())?;
    let page = state.aggregator.queries().history(&symbol, request).await?;
    Ok(Json(page))
}

pub async fn latest_summary(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
) -> Result<Json<MinuteSummary>, AppError> {
    let summary = state.aggregator.queries().latest_summary(&symbol).await?;
    Ok(Json(summary))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HistoryParams {
        let mut p = HistoryParams::default();
        for (k, v) in pairs {
            let v = Some(v.to_string());
            match *k {
                "limit" => p.limit = v,
                "before" => p.before = v,
                "cursor" => p.cursor = v,
                "view" => p.view = v,
                "agg" => p.agg = v,
                "shape" => p.shape = v,
                _ => unreachable!(),
            }
        }
        p
    }

    #[test]
    fn test_defaults() {
        let req = params(&[]).into_request(1_000).unwrap();
        assert_eq!(req.before, 1_001);
        assert_eq!(req.limit, 200);
        assert_eq!(req.view, HistoryView::Ticks);
    }

    #[test]
    fn test_cursor_aliases_and_views() {
        let req = params(&[("cursor", "500"), ("limit", "5000"), ("agg", "1M")])
            .into_request(0)
            .unwrap();
        assert_eq!(req.before, 500);
        assert_eq!(req.limit, 2000);
        assert_eq!(req.view, HistoryView::Ohlc1m);

        let req = params(&[("before", "42.9"), ("cursor", "7"), ("shape", "candle")])
            .into_request(0)
            .unwrap();
        assert_eq!(req.before, 42);
        assert_eq!(req.view, HistoryView::Ohlc1m);

        let req = params(&[("limit", "abc"), ("view", "raw")]).into_request(0).unwrap();
        assert_eq!(req.limit, 200);
        assert_eq!(req.view, HistoryView::Ticks);
    }

    #[test]
    fn test_bad_cursor_rejected() {
        assert!(matches!(
            params(&[("before", "yesterday")]).into_request(0),
            Err(AppError::BadRequest(_))
        ));
    }
}
