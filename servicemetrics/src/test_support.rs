use prometheus::proto;

/// Find the sample of `name` whose labels include all of `labels`.
pub(crate) fn find_metric<'a>(
    families: &'a [proto::MetricFamily],
    name: &str,
    labels: &[(&str, &str)],
) -> Option<&'a proto::Metric> {
    families
        .iter()
        .filter(|family| family.get_name() == name)
        .flat_map(|family| family.get_metric())
        .find(|metric| {
            labels.iter().all(|(label_name, label_value)| {
                metric
                    .get_label()
                    .iter()
                    .any(|pair| pair.get_name() == *label_name && pair.get_value() == *label_value)
            })
        })
}

pub(crate) fn counter_value(
    families: &[proto::MetricFamily],
    name: &str,
    labels: &[(&str, &str)],
) -> Option<f64> {
    find_metric(families, name, labels).map(|metric| metric.get_counter().get_value())
}
