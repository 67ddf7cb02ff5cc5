use multiversion::multiversion;

#[inline]
pub(crate) fn logaddexp(a: f64, b: f64) -> f64 {
    if a == b {
        return a + 2f64.ln();
    }
    let diff = a - b;
    if diff > 0. {
        a + (-diff).exp().ln_1p()
    } else if diff < 0. {
        b + diff.exp().ln_1p()
    } else {
        // diff is NAN
        diff
    }
}

/// Numerically stable `log(sum(exp(values)))`.
///
/// Returns negative infinity for an empty lane or a lane of only negative
/// infinities, and NaN if any value is NaN.
#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
pub(crate) fn logsumexp(values: &[f64]) -> f64 {
    let mut max = f64::NEG_INFINITY;
    for &x in values {
        if x.is_nan() {
            return x;
        }
        if x > max {
            max = x;
        }
    }
    if !max.is_finite() {
        return max;
    }

    let mut sum = 0f64;
    for &x in values {
        sum += (x - max).exp();
    }
    max + sum.ln()
}

/// `logsumexp(values) - ln(values.len())`, the log of the mean of the
/// exponentiated values.
#[inline]
pub(crate) fn logmeanexp(values: &[f64]) -> f64 {
    logsumexp(values) - (values.len() as f64).ln()
}
