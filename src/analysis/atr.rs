/// Average True Range over completed candles (Wilder's smoothing)
use crate::types::Candle;

pub fn calculate_atr(candles: &[Candle], period: usize) -> Option<f64> {
    if candles.len() < period + 1 {
        return None;
    }

    let mut tr_values = Vec::with_capacity(candles.len() - 1);
    for i in 1..candles.len() {
        let high = candles[i].high;
        let low = candles[i].low;
        let prev_close = candles[i - 1].close;

        let tr = (high - low)
            .max((high - prev_close).abs())
            .max((low - prev_close).abs());
        tr_values.push(tr);
    }

    wilder_smooth(&tr_values, period)
}

/// Wilder's smoothing (EMA-like with 1/period factor)
fn wilder_smooth(values: &[f64], period: usize) -> Option<f64> {
    if values.len() < period {
        return None;
    }

    let mut smoothed: f64 = values.iter().take(period).sum::<f64>() / period as f64;
    for value in values.iter().skip(period) {
        smoothed = ((period - 1) as f64 * smoothed + value) / period as f64;
    }

    Some(smoothed)
}
