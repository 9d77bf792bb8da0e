pub const LCD_COLUMNS: usize = 16;

/// Two lines for a 16x2 character LCD.
pub fn format_lines(current1: f32, current2: f32, total: f32) -> [String; 2] {
    let first = format!("1:{current1:.2}A 2:{current2:.2}A");
    let second = format!("Total:{total:.2}A");
    [fit(first), fit(second)]
}

fn fit(mut line: String) -> String {
    line.truncate(LCD_COLUMNS);
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_fit_the_panel() {
        let [first, second] = format_lines(1.234, 0.5, 1.734);
        assert_eq!(first, "1:1.23A 2:0.50A");
        assert_eq!(second, "Total:1.73A");

        let [wide, _] = format_lines(123.456, 789.0, 0.0);
        assert_eq!(wide.len(), LCD_COLUMNS);
    }
}
