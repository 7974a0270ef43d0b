//! End-to-end pipeline tests over a small synthetic distributor dataset.
//!
//! The dataset has one large segment (West_Plumbing, 8 customers) that
//! splits into a valve-buying and a pump-buying cluster, plus a tiny
//! segment (East_HVAC) exercising the single-cluster path. Valve customers
//! C1 and C2 co-purchase A and B, C3 buys only C, and C4 buys A with C —
//! so A sits in 6 of the cluster's 8 baskets, B in 4, and the rule A → B
//! survives with lift 4/3. C4 is the one customer it can serve.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use crate::config::PipelineConfig;
use crate::inference::{BatchRequest, InferenceRequest, RecommendationService};
use crate::models::{Recommendation, FALLBACK_TRIGGER};
use crate::pipeline::{Pipeline, PipelineInputs};
use crate::store::{ArtifactStore, FEEDBACK_FILE, FEEDBACK_SUMMARY_FILE};

fn write_inputs(dir: &Path) -> PipelineInputs {
    let customers = "customer_id,customer_name,region,end_use,customer_type,city,state,tenure,credit_limit\n\
        C1,Valley Plumbing,West,Plumbing,Contractor,Reno,NV,4,25000\n\
        C2,Sierra Pipe,West,Plumbing,Contractor,Fresno,CA,2,18000\n\
        C3,Cascade Supply,West,Plumbing,Reseller,Bend,OR,7,40000\n\
        C4,Foothill Mechanical,West,Plumbing,Contractor,Boise,ID,3,22000\n\
        C5,Delta Pumps,West,Plumbing,Contractor,Stockton,CA,5,30000\n\
        C6,Rio Water Works,West,Plumbing,Municipal,Tucson,AZ,9,60000\n\
        C7,Summit Irrigation,West,Plumbing,Contractor,Ogden,UT,1,12000\n\
        C8,Basin Well Service,West,Plumbing,Contractor,Elko,NV,6,28000\n\
        E1,Metro Air,East,HVAC,Contractor,Albany,NY,4,20000\n\
        E2,Harbor Climate,East,HVAC,Contractor,Portland,ME,3,15000\n";

    let products = "product_id,product_name,brand,l2_category,l3_category,functionality,unit_price,unit_of_measure,in_stock\n\
        A,Ball Valve 2in,Acme,Valves,Ball Valves,Flow Control,10.00,EA,True\n\
        B,Gate Valve 2in,Acme,Valves,Gate Valves,Flow Control,5.00,EA,True\n\
        C,Check Valve 2in,Acme,Valves,Check Valves,Flow Control,8.00,EA,True\n\
        D,Sump Pump 1HP,Borel,Pumps,Sump Pumps,Water Transfer,20.00,EA,True\n\
        E,Well Pump 2HP,Borel,Pumps,Well Pumps,Water Transfer,25.00,EA,True\n\
        F,Booster Pump,Borel,Pumps,Booster Pumps,Water Transfer,30.00,EA,False\n\
        H,Air Handler,Clima,Air Handling,Air Handlers,Ventilation,90.00,EA,True\n";

    // Two purchase sessions per customer, 40 days apart; with a 7-day
    // window every date is its own basket.
    let mut invoices = String::from(
        "invoice_id,customer_id,product_id,quantity,invoice_date,unit_price,line_total\n",
    );
    for (ix, cust) in ["C1", "C2"].iter().enumerate() {
        invoices.push_str(&format!(
            "IV{ix}a,{cust},A,2,2024-03-01,10.00,20.00\n\
             IV{ix}a,{cust},B,1,2024-03-01,5.00,5.00\n\
             IV{ix}b,{cust},A,2,2024-04-10,10.00,20.00\n\
             IV{ix}b,{cust},B,1,2024-04-10,5.00,5.00\n",
        ));
    }
    invoices.push_str(
        "IV3a,C3,C,1,2024-03-01,8.00,8.00\n\
         IV3b,C3,C,1,2024-04-10,8.00,8.00\n\
         IV4a,C4,A,4,2024-03-01,10.00,40.00\n\
         IV4a,C4,C,1,2024-03-01,8.00,8.00\n\
         IV4b,C4,A,4,2024-04-10,10.00,40.00\n\
         IV4b,C4,C,1,2024-04-10,8.00,8.00\n",
    );
    for (ix, cust) in ["C5", "C6", "C7", "C8"].iter().enumerate() {
        invoices.push_str(&format!(
            "IP{ix}a,{cust},D,1,2024-03-01,20.00,20.00\n\
             IP{ix}a,{cust},E,1,2024-03-01,25.00,25.00\n\
             IP{ix}b,{cust},D,1,2024-04-10,20.00,20.00\n\
             IP{ix}b,{cust},E,1,2024-04-10,25.00,25.00\n",
        ));
    }
    // the out-of-stock booster pump was bought once, so it sits in the
    // segment pool but must never be recommended
    invoices.push_str("IP0f,C5,F,1,2024-03-01,30.00,30.00\n");
    invoices.push_str(
        "IE1,E1,H,1,2024-03-05,90.00,90.00\n\
         IE2,E2,H,2,2024-03-06,90.00,180.00\n",
    );

    fs::write(dir.join("customers.csv"), customers).unwrap();
    fs::write(dir.join("products.csv"), products).unwrap();
    fs::write(dir.join("invoices.csv"), invoices).unwrap();

    PipelineInputs {
        customers: dir.join("customers.csv"),
        products: dir.join("products.csv"),
        invoices: dir.join("invoices.csv"),
    }
}

fn test_config() -> PipelineConfig {
    PipelineConfig {
        window_days: 7,
        max_k: 2,
        ..PipelineConfig::default()
    }
}

fn run_pipeline(run_dir: &Path, with_feedback: bool) -> (Pipeline, PipelineInputs) {
    let inputs = write_inputs(run_dir.parent().unwrap());
    let store = ArtifactStore::open(run_dir).unwrap();
    if with_feedback {
        let feedback = "customer_id,product_id,rating,reason_code,sentiment,feedback_date\n\
            C4,B,High,good_fit,,2024-06-01\n\
            C1,D,Low,not_relevant,,2024-06-01\n\
            C9,X,Low,out_of_territory,,2024-06-01\n";
        fs::write(store.path(FEEDBACK_FILE), feedback).unwrap();
    }
    let pipeline = Pipeline::new(test_config(), store);
    pipeline.run(&inputs).unwrap();
    (pipeline, inputs)
}

fn recs_for<'a>(recs: &'a [Recommendation], cust: &str) -> Vec<&'a Recommendation> {
    recs.iter().filter(|r| r.customer_id == cust).collect()
}

#[test]
fn test_full_pipeline_artifacts_and_invariants() {
    let dir = tempfile::tempdir().unwrap();
    let (pipeline, _) = run_pipeline(&dir.path().join("run"), false);
    let store = pipeline.store();

    let basket = store.read_basket().unwrap();
    let assignments = store.read_assignments().unwrap();
    let rules = store.read_rules().unwrap();
    let recs = store.read_recommendations().unwrap();

    // every basket customer has exactly one cluster
    let basket_customers: BTreeSet<&str> =
        basket.iter().map(|r| r.customer_id.as_str()).collect();
    let mut assigned = BTreeSet::new();
    for a in &assignments {
        assert!(assigned.insert(a.customer_id.as_str()), "duplicate cluster for {}", a.customer_id);
    }
    assert_eq!(basket_customers, assigned);

    // the tiny segment collapsed to a single prefixed cluster
    for e in ["E1", "E2"] {
        let a = assignments.iter().find(|a| a.customer_id == e).unwrap();
        assert_eq!(a.cluster_id, "East_HVAC_0");
    }

    // A -> B survives with lift 4/3 (and so does its mirror B -> A, which
    // no customer can use because every B buyer already owns A)
    assert_eq!(rules.len(), 2);
    let ab = &rules[0];
    assert_eq!((ab.product_a.as_str(), ab.product_b.as_str()), ("A", "B"));
    assert!((ab.confidence - 2.0 / 3.0).abs() < 1e-9);
    assert!((ab.support - 0.5).abs() < 1e-9);
    assert!((ab.lift - 4.0 / 3.0).abs() < 1e-9);
    assert_eq!(ab.pair_freq, 4);
    assert_eq!(ab.product_freq, 6);
    assert_eq!((rules[1].product_a.as_str(), rules[1].product_b.as_str()), ("B", "A"));

    // purchase history per customer for the invariant checks
    let mut bought: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for row in &basket {
        bought
            .entry(row.customer_id.as_str())
            .or_default()
            .insert(row.product_id.as_str());
    }

    for rec in &recs {
        let history = &bought[rec.customer_id.as_str()];
        assert!(
            !history.contains(rec.recommended_product.as_str()),
            "{} was recommended {} which they already buy",
            rec.customer_id,
            rec.recommended_product,
        );
        if !rec.is_fallback() {
            assert!(history.contains(rec.trigger_product.as_str()));
        }
        assert_ne!(rec.recommended_product, "F", "out-of-stock product recommended");
        assert!(rec.recommended_qty >= 1);
    }

    // ranks are 1..N contiguous with no ties, N <= top_k
    for cust in recs.iter().map(|r| r.customer_id.as_str()).collect::<BTreeSet<_>>() {
        let ranks: Vec<u32> = recs_for(&recs, cust).iter().map(|r| r.rank).collect();
        let expected: Vec<u32> = (1..=ranks.len() as u32).collect();
        assert_eq!(ranks, expected, "ranks for {cust}");
        assert!(ranks.len() <= 5);
    }

    // C4 is the one customer the association rule serves: trigger A, B at
    // the top, quantity from its median per-order A volume
    let c4 = recs_for(&recs, "C4");
    assert_eq!(c4[0].recommended_product, "B");
    assert_eq!(c4[0].trigger_product, "A");
    assert_eq!(c4[0].rank, 1);
    assert_eq!(c4[0].recommended_qty, 4);
    assert!(c4[0].reason.contains("A -> B"));

    // C1 already owns B, so everything it gets is fallback, led by the
    // valve with full L2 affinity
    let c1 = recs_for(&recs, "C1");
    assert!(c1.iter().all(|r| r.trigger_product == FALLBACK_TRIGGER));
    assert_eq!(c1[0].recommended_product, "C");
    assert!((c1[0].score - 1.1).abs() < 1e-9);
}

#[test]
fn test_feedback_calibration_and_summary() {
    let dir = tempfile::tempdir().unwrap();
    let (pipeline, _) = run_pipeline(&dir.path().join("run"), true);
    let store = pipeline.store();

    let recs = store.read_recommendations().unwrap();
    let finals = store.read_final_recommendations().unwrap();

    // C4's High feedback multiplies the score by 1.3
    let before = recs_for(&recs, "C4")[0].score;
    let after = recs_for(&finals, "C4")[0].score;
    assert!((after - before * 1.3).abs() < 1e-9);

    // C1's Low feedback on D pushes 0.1 * 0.1 under the cutoff
    let c1_finals = recs_for(&finals, "C1");
    assert!(!c1_finals.iter().any(|r| r.recommended_product == "D"));
    // survivors re-rank contiguously
    let ranks: Vec<u32> = c1_finals.iter().map(|r| r.rank).collect();
    assert_eq!(ranks, (1..=ranks.len() as u32).collect::<Vec<_>>());

    let summary: crate::feedback::FeedbackSummary =
        crate::serialization::read_json(&store.path(FEEDBACK_SUMMARY_FILE)).unwrap();
    assert_eq!(summary.overall.feedback_rows, 3);
    // 1 of 3 rows accepted (the High) — low acceptance suggests tightening
    assert!((summary.overall.acceptance_rate.unwrap() - 1.0 / 3.0).abs() < 1e-9);
    assert_eq!(summary.threshold_suggestions.action, "tighten");
    assert_eq!(summary.reason_codes["good_fit"], 1);
    assert_eq!(summary.reason_codes["not_relevant"], 1);
    // unmatched feedback lands in the Unknown bucket
    assert!(summary.per_segment.contains_key("Unknown"));
}

#[test]
fn test_rerun_produces_byte_identical_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let (first, _) = run_pipeline(&dir.path().join("run_a"), false);

    let dir_b = tempfile::tempdir().unwrap();
    let (second, _) = run_pipeline(&dir_b.path().join("run_b"), false);

    for artifact in [
        "market_basket.csv",
        "associations.csv",
        "recommendations.csv",
        "final_recommendations.csv",
    ] {
        let a = fs::read(first.store().path(artifact)).unwrap();
        let b = fs::read(second.store().path(artifact)).unwrap();
        assert_eq!(a, b, "{artifact} differs between identical reruns");
    }
    let a = fs::read(first.store().path("model/customer_clusters.csv")).unwrap();
    let b = fs::read(second.store().path("model/customer_clusters.csv")).unwrap();
    assert_eq!(a, b, "cluster assignments differ between identical reruns");
}

#[test]
fn test_inference_over_completed_run() {
    let dir = tempfile::tempdir().unwrap();
    let (pipeline, _) = run_pipeline(&dir.path().join("run"), false);
    let service = RecommendationService::load(pipeline.store()).unwrap();

    // Path A: precomputed, sorted by rank
    let resp = service.handle(&InferenceRequest {
        customer_id: "C4".to_string(),
        segment: None,
        purchase_vector: None,
    });
    assert_eq!(resp.source, "precomputed");
    assert_eq!(resp.recommendations[0].recommended_product, "B");

    // Path B: cold start lands a valve-heavy newcomer with the valve buyers
    let resp = service.handle(&InferenceRequest {
        customer_id: "NEWCO".to_string(),
        segment: Some("West_Plumbing".to_string()),
        purchase_vector: Some(BTreeMap::from([("Valves".to_string(), 10.0)])),
    });
    assert_eq!(resp.source, "realtime_assignment");
    assert!(resp.recommendations.is_empty());
    assert!(resp.message.is_some());
    let assignments = pipeline.store().read_assignments().unwrap();
    let valve_cluster = &assignments
        .iter()
        .find(|a| a.customer_id == "C1")
        .unwrap()
        .cluster_id;
    assert_eq!(resp.cluster_id.as_ref(), Some(valve_cluster));

    // cold start also works for the tiny segment: it collapsed to a single
    // cluster but its model was still persisted
    let resp = service.handle(&InferenceRequest {
        customer_id: "NEWHVAC".to_string(),
        segment: Some("East_HVAC".to_string()),
        purchase_vector: Some(BTreeMap::from([("Air Handling".to_string(), 3.0)])),
    });
    assert_eq!(resp.source, "realtime_assignment");
    assert_eq!(resp.cluster_id.as_deref(), Some("East_HVAC_0"));

    // batch keeps per-instance failures inline
    let batch = service.handle_batch(&BatchRequest {
        instances: vec![
            InferenceRequest {
                customer_id: "C1".to_string(),
                segment: None,
                purchase_vector: None,
            },
            InferenceRequest {
                customer_id: "GHOST".to_string(),
                segment: None,
                purchase_vector: None,
            },
        ],
    });
    assert_eq!(batch.predictions.len(), 2);
    assert_eq!(batch.predictions[0].source, "precomputed");
    assert_eq!(batch.predictions[1].source, "error");
}

#[test]
fn test_registry_records_segment_diagnostics() {
    let dir = tempfile::tempdir().unwrap();
    let (pipeline, _) = run_pipeline(&dir.path().join("run"), false);
    let (registry, models) =
        crate::clustering::load_models(&pipeline.store().model_dir().unwrap()).unwrap();

    let entry = &registry["West_Plumbing"];
    assert_eq!(entry.n_customers, 8);
    assert_eq!(entry.k, 2);
    assert_eq!(entry.feature_cols, models["West_Plumbing"].columns);
    assert!(entry.inertia >= 0.0);

    // the tiny segment still persists a trivial single-cluster model so
    // cold-start requests for it can resolve
    let east = &registry["East_HVAC"];
    assert_eq!(east.n_customers, 2);
    assert_eq!(east.k, 1);
    assert_eq!(models["East_HVAC"].kmeans.k(), 1);
}
