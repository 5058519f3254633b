use std::collections::HashMap;
use std::time::{Duration, Instant};

/// 性能监控工具：追踪各个操作的执行时间
#[derive(Debug, Default)]
pub struct PerformanceMonitor {
    timers: HashMap<String, Vec<Duration>>,
    running: HashMap<String, Instant>,
}

impl PerformanceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 开始计时
    pub fn start(&mut self, name: &str) {
        self.running.insert(name.to_string(), Instant::now());
        log::debug!("⏱️  开始: {}", name);
    }

    /// 结束计时并记录；没有对应的 `start` 时返回 `None`
    pub fn stop(&mut self, name: &str) -> Option<Duration> {
        let elapsed = self.running.remove(name)?.elapsed();
        self.timers.entry(name.to_string()).or_default().push(elapsed);
        log::info!("✓ 完成: {} (耗时: {:.2}秒)", name, elapsed.as_secs_f32());
        Some(elapsed)
    }

    /// 计时一个闭包
    pub fn time<T>(&mut self, name: &str, f: impl FnOnce() -> T) -> T {
        self.start(name);
        let value = f();
        self.stop(name);
        value
    }

    pub fn count(&self, name: &str) -> usize {
        self.timers.get(name).map_or(0, Vec::len)
    }

    pub fn average(&self, name: &str) -> Option<Duration> {
        let durations = self.timers.get(name)?;
        let total: Duration = durations.iter().sum();
        Some(total / durations.len() as u32)
    }

    pub fn total(&self, name: &str) -> Option<Duration> {
        self.timers.get(name).map(|durations| durations.iter().sum())
    }

    /// 按名字排序的汇总报告
    pub fn report(&self) -> String {
        let mut items: Vec<_> = self.timers.iter().collect();
        items.sort_by_key(|(name, _)| *name);

        items
            .into_iter()
            .map(|(name, durations)| {
                let total: Duration = durations.iter().sum();
                format!(
                    "{:32} 次数 {:5} | 总耗时 {:8.3}s | 平均 {:8.4}s",
                    name,
                    durations.len(),
                    total.as_secs_f32(),
                    (total / durations.len() as u32).as_secs_f32()
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn log_report(&self) {
        log::info!("📊 性能监控报告\n{}", self.report());
    }

    pub fn reset(&mut self) {
        self.timers.clear();
        self.running.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_records_each_call() {
        let mut monitor = PerformanceMonitor::new();
        let value = monitor.time("sum", || (1..=10).sum::<i32>());
        monitor.time("sum", || ());

        assert_eq!(value, 55);
        assert_eq!(monitor.count("sum"), 2);
        assert!(monitor.average("sum").is_some());
        assert!(monitor.report().contains("sum"));
        assert_eq!(monitor.stop("never_started"), None);
    }
}
