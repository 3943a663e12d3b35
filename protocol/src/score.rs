//! Deterministic farm scoring.
//!
//! Every validator must produce bitwise-identical scores for identical
//! returns series, so all arithmetic here is plain IEEE-754 f64 with
//! explicit left-to-right accumulation. Do not replace the loops with
//! tree or pairwise reductions.

/// Combine the risk metrics into the protocol score:
/// 0.4·Sortino + 0.4·Sharpe + 0.2·MaxDrawdown + 2·MeanReturn,
/// rounded half-to-even at the sixth decimal digit.
pub fn farm_score(returns: &[f64]) -> f64 {
    if returns.is_empty() {
        return 0.0;
    }

    let sharpe = sharpe_ratio(returns);
    let sortino = sortino_ratio(returns);
    let drawdown = max_drawdown(returns);
    let mean = mean_return(returns);

    let score = 0.4 * sortino + 0.4 * sharpe + 0.2 * drawdown + 2.0 * mean;

    // Rounding is part of the wire contract, not presentation.
    (score * 1_000_000.0).round_ties_even() / 1_000_000.0
}

fn mean_return(returns: &[f64]) -> f64 {
    if returns.is_empty() {
        return 0.0;
    }
    let mut sum = 0.0;
    for r in returns {
        sum += r;
    }
    sum / returns.len() as f64
}

/// Sharpe ratio with a zero risk-free rate, using the sample standard
/// deviation (n − 1 denominator).
fn sharpe_ratio(returns: &[f64]) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let mean = mean_return(returns);
    let mut variance = 0.0;
    for r in returns {
        variance += (r - mean) * (r - mean);
    }
    variance /= (returns.len() - 1) as f64;
    let std_dev = variance.sqrt();
    if std_dev == 0.0 {
        return 0.0;
    }
    mean / std_dev
}

/// Sortino ratio: mean return over the downside deviation of strictly
/// negative periods. A series with no losses scores 10·mean — an
/// intentional high-value sentinel, not an overflow guard.
fn sortino_ratio(returns: &[f64]) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let mean = mean_return(returns);
    let mut downside_sum = 0.0;
    let mut downside_count = 0usize;
    for r in returns {
        if *r < 0.0 {
            downside_sum += r * r;
            downside_count += 1;
        }
    }
    if downside_count == 0 {
        return mean * 10.0;
    }
    let downside_dev = (downside_sum / downside_count as f64).sqrt();
    if downside_dev == 0.0 {
        return 0.0;
    }
    mean / downside_dev
}

/// Maximum peak-to-trough drawdown of the compounded series.
fn max_drawdown(returns: &[f64]) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let mut cumulative = vec![0.0; returns.len()];
    cumulative[0] = 1.0 + returns[0];
    for i in 1..returns.len() {
        cumulative[i] = cumulative[i - 1] * (1.0 + returns[i]);
    }

    let mut max_drawdown = 0.0;
    let mut peak = cumulative[0];
    for value in cumulative {
        if value > peak {
            peak = value;
        } else {
            let drawdown = (peak - value) / peak;
            if drawdown > max_drawdown {
                max_drawdown = drawdown;
            }
        }
    }
    max_drawdown
}
